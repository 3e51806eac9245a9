use swarm_fc::dispatch::{AckCode, Command, CommandKind};
use swarm_fc::link::LinkStatus;
use swarm_fc::{ConnectionError, DispatchError, LinkLost, TelemetryTimeout};
use swarm_proto::phase::FlightPhase;

/// Why a mission ended in `Failed`. Captured in the outcome, never raised.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MissionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("{command:?} rejected by vehicle ({code:?})")]
    CommandRejected { command: Command, code: AckCode },

    #[error("{command:?} not acknowledged")]
    CommandTimeout { command: Command },

    #[error(transparent)]
    TelemetryTimeout(#[from] TelemetryTimeout),

    #[error("link to vehicle lost")]
    LinkLost,

    #[error("{0:?} already pending")]
    CommandAlreadyPending(CommandKind),

    #[error("cannot send {command:?} while link is {status:?}")]
    NotConnected { command: CommandKind, status: LinkStatus },

    #[error("mission needs phase {expected:?}, controller is {actual:?}")]
    InvalidPhase { expected: FlightPhase, actual: FlightPhase },

    #[error("illegal phase change {from:?} -> {to:?}")]
    InvalidTransition { from: FlightPhase, to: FlightPhase },

    #[error("aborted by operator")]
    Aborted,
}

impl From<LinkLost> for MissionError {
    fn from(_: LinkLost) -> Self {
        MissionError::LinkLost
    }
}

impl From<DispatchError> for MissionError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::NotConnected { status: LinkStatus::Lost, .. } => MissionError::LinkLost,
            DispatchError::NotConnected { command, status } => MissionError::NotConnected { command, status },
            DispatchError::CommandAlreadyPending(kind) => MissionError::CommandAlreadyPending(kind),
            DispatchError::LinkLost(_) => MissionError::LinkLost,
        }
    }
}

impl MissionError {
    /// True when nothing more can be sent to the vehicle.
    pub fn is_link_loss(&self) -> bool {
        matches!(self, MissionError::LinkLost | MissionError::NotConnected { .. })
    }
}
