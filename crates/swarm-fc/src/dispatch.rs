use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mavlink::common::{MavCmd, MavMessage, MavModeFlag, MavResult, COMMAND_ACK_DATA, COMMAND_LONG_DATA};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, LinkLost};
use crate::link::{Link, LinkStatus};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Arm,
    Disarm,
    Takeoff { altitude_m: f32 },
    Land,
}

/// One per MAVLink command id. `SetMode` names mode changes in errors only;
/// its acks are never correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    ArmDisarm,
    Takeoff,
    Land,
    SetMode,
}

impl CommandKind {
    pub fn mav_cmd(self) -> MavCmd {
        match self {
            CommandKind::ArmDisarm => MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            CommandKind::Takeoff => MavCmd::MAV_CMD_NAV_TAKEOFF,
            CommandKind::Land => MavCmd::MAV_CMD_NAV_LAND,
            CommandKind::SetMode => MavCmd::MAV_CMD_DO_SET_MODE,
        }
    }

    pub fn from_mav(cmd: MavCmd) -> Option<Self> {
        match cmd {
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM => Some(CommandKind::ArmDisarm),
            MavCmd::MAV_CMD_NAV_TAKEOFF => Some(CommandKind::Takeoff),
            MavCmd::MAV_CMD_NAV_LAND => Some(CommandKind::Land),
            _ => None,
        }
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Arm | Command::Disarm => CommandKind::ArmDisarm,
            Command::Takeoff { .. } => CommandKind::Takeoff,
            Command::Land => CommandKind::Land,
        }
    }

    fn params(&self) -> [f32; 7] {
        match *self {
            Command::Arm => [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            Command::Disarm => [0.0; 7],
            Command::Takeoff { altitude_m } => [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, altitude_m],
            Command::Land => [0.0; 7],
        }
    }
}

/// Negative COMMAND_ACK result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    TemporarilyRejected,
    Denied,
    Unsupported,
    Failed,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Accepted,
    Rejected(AckCode),
    TimedOut,
}

enum AckOutcome {
    Final(CommandResult),
    InProgress,
}

fn classify(result: MavResult) -> AckOutcome {
    let code = match result {
        MavResult::MAV_RESULT_ACCEPTED => return AckOutcome::Final(CommandResult::Accepted),
        MavResult::MAV_RESULT_IN_PROGRESS => return AckOutcome::InProgress,
        MavResult::MAV_RESULT_TEMPORARILY_REJECTED => AckCode::TemporarilyRejected,
        MavResult::MAV_RESULT_DENIED => AckCode::Denied,
        MavResult::MAV_RESULT_UNSUPPORTED => AckCode::Unsupported,
        MavResult::MAV_RESULT_FAILED => AckCode::Failed,
        other => AckCode::Other(other as u8),
    };
    AckOutcome::Final(CommandResult::Rejected(code))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingCommand {
    pub command: CommandKind,
    pub sent_at: Instant,
    pub ack_window: Duration,
    pub retries_remaining: u8,
}

struct Waiter {
    id: u64,
    info: PendingCommand,
    tx: oneshot::Sender<CommandResult>,
}

struct Inner {
    link: Arc<Link>,
    pending: Mutex<HashMap<CommandKind, Waiter>>,
    next_id: AtomicU64,
    ack_window: Duration,
    retries: u8,
}

/// Sends COMMAND_LONGs and matches them with COMMAND_ACKs.
///
/// One in-flight command per command id. Each dispatch waits `ack_window`,
/// resends `retries` times, then gives up with `TimedOut`.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(link: Arc<Link>, ack_window: Duration, retries: u8) -> Self {
        Self {
            inner: Arc::new(Inner {
                link,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                ack_window,
                retries,
            }),
        }
    }

    pub async fn dispatch(&self, cmd: Command) -> Result<CommandResult, DispatchError> {
        let kind = cmd.kind();
        let status = self.inner.link.status();
        if status != LinkStatus::Connected {
            return Err(DispatchError::NotConnected { command: kind, status });
        }

        let (id, mut rx) = self.register(kind)?;
        let _guard = PendingGuard { dispatcher: self, kind, id };

        let attempts = 1 + self.inner.retries as u16;
        for attempt in 0..attempts {
            let retries_remaining = (attempts - 1 - attempt) as u8;
            self.touch(kind, id, retries_remaining);
            self.send_command_long(kind.mav_cmd(), cmd.params(), attempt as u8)?;
            info!("FC: sent {:?} (attempt {}/{})", cmd, attempt + 1, attempts);

            match tokio::time::timeout(self.inner.ack_window, &mut rx).await {
                Ok(Ok(result)) => {
                    info!("FC: {:?} -> {:?}", cmd, result);
                    return Ok(result);
                }
                Ok(Err(_)) => return Err(DispatchError::LinkLost(LinkLost)),
                Err(_) => warn!(
                    "FC: no ack for {:?} within {:?} (attempt {}/{})",
                    cmd, self.inner.ack_window, attempt + 1, attempts
                ),
            }
        }
        warn!("FC: {:?} timed out", cmd);
        Ok(CommandResult::TimedOut)
    }

    /// Fire-and-forget mode change. Whether it took effect shows up in the
    /// vehicle heartbeat.
    ///
    /// Goes out as MAV_CMD_DO_SET_MODE: the SET_MODE message types `base_mode`
    /// as `MavMode`, which has no value with MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
    /// set, so it cannot select a custom mode.
    pub fn set_mode(&self, custom_mode: u32) -> Result<(), DispatchError> {
        let status = self.inner.link.status();
        if status != LinkStatus::Connected {
            return Err(DispatchError::NotConnected { command: CommandKind::SetMode, status });
        }
        let params = [
            MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32,
            custom_mode as f32,
            0.0,
            0.0,
            0.0,
            0.0,
            0.0,
        ];
        info!("FC: requesting custom mode {}", custom_mode);
        self.send_command_long(CommandKind::SetMode.mav_cmd(), params, 0)?;
        Ok(())
    }

    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        self.pending().values().map(|w| w.info).collect()
    }

    pub fn is_pending(&self, kind: CommandKind) -> bool {
        self.pending().contains_key(&kind)
    }

    /// Resolves the matching pending command. Acks nobody waits for are dropped.
    pub(crate) fn on_ack(&self, ack: &COMMAND_ACK_DATA) {
        let Some(kind) = CommandKind::from_mav(ack.command) else {
            debug!("FC: ack for untracked command {:?}", ack.command);
            return;
        };
        let result = match classify(ack.result) {
            AckOutcome::InProgress => {
                debug!("FC: {:?} in progress", kind);
                return;
            }
            AckOutcome::Final(result) => result,
        };
        match self.pending().remove(&kind) {
            Some(waiter) => {
                let _ = waiter.tx.send(result);
            }
            None => debug!("FC: unsolicited ack {:?} for {:?}", ack.result, kind),
        }
    }

    /// Drops every waiter; their dispatches fail with LinkLost.
    pub(crate) fn fail_all(&self) {
        self.pending().clear();
    }

    fn register(&self, kind: CommandKind) -> Result<(u64, oneshot::Receiver<CommandResult>), DispatchError> {
        let mut pending = self.pending();
        if pending.contains_key(&kind) {
            return Err(DispatchError::CommandAlreadyPending(kind));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let info = PendingCommand {
            command: kind,
            sent_at: Instant::now(),
            ack_window: self.inner.ack_window,
            retries_remaining: self.inner.retries,
        };
        pending.insert(kind, Waiter { id, info, tx });
        Ok((id, rx))
    }

    fn touch(&self, kind: CommandKind, id: u64, retries_remaining: u8) {
        if let Some(w) = self.pending().get_mut(&kind) {
            if w.id == id {
                w.info.sent_at = Instant::now();
                w.info.retries_remaining = retries_remaining;
            }
        }
    }

    fn release(&self, kind: CommandKind, id: u64) {
        let mut pending = self.pending();
        if pending.get(&kind).is_some_and(|w| w.id == id) {
            pending.remove(&kind);
        }
    }

    fn send_command_long(&self, command: MavCmd, p: [f32; 7], confirmation: u8) -> Result<(), LinkLost> {
        let (target_system, target_component) = self.inner.link.target().unwrap_or((0, 0));
        let cmd = COMMAND_LONG_DATA {
            target_system,
            target_component,
            command,
            confirmation,
            param1: p[0],
            param2: p[1],
            param3: p[2],
            param4: p[3],
            param5: p[4],
            param6: p[5],
            param7: p[6],
        };
        self.inner.link.send(MavMessage::COMMAND_LONG(cmd))
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<CommandKind, Waiter>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Frees the slot when a dispatch finishes, times out or is dropped mid-wait.
struct PendingGuard<'a> {
    dispatcher: &'a Dispatcher,
    kind: CommandKind,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.release(self.kind, self.id);
    }
}
