use std::fmt;
use std::future::Future;
use std::time::Duration;

use swarm_fc::dispatch::{Command, CommandResult};
use swarm_fc::link::LinkStatus;
use swarm_fc::rc_override::OverrideChannel;
use swarm_fc::{LinkConfig, Session};
use swarm_proto::phase::{FlightPhase, PhaseTransition};
use swarm_proto::rc::OverridePacket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::MissionError;
use crate::manual::{script_duration, ManualStep};
use crate::MissionConfig;

/// How a mission ended: the final phase, what made it fail, and every phase
/// change on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionOutcome {
    pub phase: FlightPhase,
    pub cause: Option<MissionError>,
    pub transitions: Vec<PhaseTransition>,
}

impl MissionOutcome {
    pub fn succeeded(&self) -> bool {
        self.phase == FlightPhase::Disarmed && self.cause.is_none()
    }

    /// Phases visited in order, starting with the initial one.
    pub fn path(&self) -> Vec<FlightPhase> {
        let mut path: Vec<FlightPhase> = self.transitions.first().map(|t| t.from).into_iter().collect();
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }
}

impl fmt::Display for MissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path: Vec<String> = self.path().iter().map(|p| format!("{:?}", p)).collect();
        write!(f, "{:?} [{}]", self.phase, path.join(" -> "))?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// Drives one session through the arm, fly, land, disarm lifecycle.
///
/// The phase only changes here, in the foreground; the receive loop and the
/// override transmitter never touch it. Failures never escape: every run
/// resolves into a `MissionOutcome`, with an airborne vehicle getting one
/// LAND + DISARM attempt first.
pub struct FlightController {
    session: Session,
    cfg: MissionConfig,
    phase: FlightPhase,
    transitions: Vec<PhaseTransition>,
    cause: Option<MissionError>,
    sticks: Option<OverrideChannel>,
    // TAKEOFF went out and was not refused; the vehicle may be climbing
    // even if the ack never arrived.
    climb_requested: bool,
}

impl FlightController {
    pub async fn start(link: &LinkConfig, cfg: MissionConfig) -> Result<Self, MissionError> {
        let session = Session::start(link).await?;
        Ok(Self::new(session, cfg))
    }

    pub fn new(session: Session, cfg: MissionConfig) -> Self {
        let mut ctl = Self {
            session,
            cfg,
            phase: FlightPhase::Disconnected,
            transitions: Vec::new(),
            cause: None,
            sticks: None,
            climb_requested: false,
        };
        // a session only exists once the vehicle heartbeat was seen
        ctl.record(FlightPhase::Connected);
        ctl
    }

    pub fn phase(&self) -> FlightPhase {
        self.phase
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn outcome(&self) -> MissionOutcome {
        MissionOutcome {
            phase: self.phase,
            cause: self.cause.clone(),
            transitions: self.transitions.clone(),
        }
    }

    /// Arm, take off to `altitude_m`, cruise, land and disarm.
    pub async fn run_standard_mission(&mut self, altitude_m: f32) -> MissionOutcome {
        if let Err(e) = self.require_phase(FlightPhase::Connected) {
            return self.refused(e);
        }
        info!("mission: standard flight to {:.1} m", altitude_m);
        let res = self.fly_standard(altitude_m).await;
        self.finish(res).await
    }

    /// Arm, fly `script` on the sticks, then land and disarm.
    pub async fn run_manual_sequence(&mut self, script: &[ManualStep]) -> MissionOutcome {
        if let Err(e) = self.require_phase(FlightPhase::Connected) {
            return self.refused(e);
        }
        info!("mission: manual sequence, {} steps over {:?}", script.len(), script_duration(script));
        let res = self.fly_manual(script).await;
        self.finish(res).await
    }

    /// Interrupt: hand the sticks back, mark the run failed and close the
    /// session. Sends no LAND.
    pub async fn abort(mut self) -> MissionOutcome {
        warn!("mission: abort in {:?}", self.phase);
        self.drop_sticks().await;
        if !self.phase.is_terminal() {
            self.record(FlightPhase::Failed);
            self.cause = Some(MissionError::Aborted);
        }
        let outcome = self.outcome();
        self.shutdown().await;
        outcome
    }

    pub async fn shutdown(mut self) {
        self.drop_sticks().await;
        self.session.shutdown().await;
    }

    async fn fly_standard(&mut self, altitude_m: f32) -> Result<(), MissionError> {
        self.arm().await?;
        if let Some(mode) = self.cfg.takeoff_mode() {
            self.request_mode(mode).await?;
        }

        let takeoff = self.command(Command::Takeoff { altitude_m }).await;
        self.climb_requested = !matches!(takeoff, Err(MissionError::CommandRejected { .. }));
        takeoff?;
        self.transition(FlightPhase::TakingOff)?;

        let goal = altitude_m * self.cfg.takeoff_fraction();
        let climb = self.session.telemetry().wait_altitude_at_least(goal, self.cfg.takeoff_timeout());
        let reached = self.guard(climb).await??;
        info!("mission: reached {:.2} m (goal {:.2} m)", reached, goal);
        self.transition(FlightPhase::Airborne)?;

        match self.cfg.cruise_script.clone() {
            Some(script) => self.fly_script(&script).await?,
            None => self.cruise(self.cfg.cruise_duration()).await?,
        }
        self.land_and_disarm().await
    }

    async fn fly_manual(&mut self, script: &[ManualStep]) -> Result<(), MissionError> {
        self.arm().await?;
        if let Some(mode) = self.cfg.manual_mode() {
            self.request_mode(mode).await?;
        }
        self.fly_script(script).await?;
        self.land_and_disarm().await
    }

    async fn arm(&mut self) -> Result<(), MissionError> {
        self.command(Command::Arm).await?;
        self.transition(FlightPhase::Armed)
    }

    async fn land_and_disarm(&mut self) -> Result<(), MissionError> {
        self.command(Command::Land).await?;
        self.transition(FlightPhase::Landing)?;
        self.wait_landed().await?;
        self.command(Command::Disarm).await?;
        self.transition(FlightPhase::Disarmed)
    }

    // Not reaching the ground in time only delays the DISARM.
    async fn wait_landed(&self) -> Result<(), MissionError> {
        let threshold = self.cfg.landed_threshold_m();
        let descent = self.session.telemetry().wait_altitude_at_most(threshold, self.cfg.land_timeout());
        match self.guard(descent).await? {
            Ok(alt) => info!("mission: on the ground ({:.2} m)", alt),
            Err(e) => warn!("mission: {}; disarming anyway", e),
        }
        Ok(())
    }

    async fn cruise(&self, duration: Duration) -> Result<(), MissionError> {
        info!("mission: cruising for {:?}", duration);
        let deadline = Instant::now() + duration;
        let mut second = 0u32;
        while Instant::now() < deadline {
            let nap = deadline.saturating_duration_since(Instant::now()).min(Duration::from_secs(1));
            self.guard(tokio::time::sleep(nap)).await?;
            second += 1;
            match self.session.telemetry().latest_position() {
                Some(p) => info!(
                    "cruise: {:>4}s | {:6.2} m | {:.2} m/s",
                    second,
                    p.relative_alt_m,
                    p.ground_speed_mps()
                ),
                None => info!("cruise: {:>4}s | (no data)", second),
            }
        }
        Ok(())
    }

    async fn fly_script(&mut self, script: &[ManualStep]) -> Result<(), MissionError> {
        let cadence = self.cfg.override_cadence();
        let first = script.first().map_or(OverridePacket::RELEASE, |s| s.sticks);
        self.sticks = Some(self.session.begin_override(cadence, first));
        self.transition(FlightPhase::ManualOverride)?;

        for step in script {
            self.play(step, cadence).await?;
        }

        let Some(mut sticks) = self.sticks.take() else { return Ok(()) };
        let released = sticks.release();
        sticks.end().await;
        released?;
        self.guard(tokio::time::sleep(self.cfg.release_settle())).await
    }

    async fn play(&self, step: &ManualStep, cadence: Duration) -> Result<(), MissionError> {
        let Some(sticks) = self.sticks.as_ref() else { return Ok(()) };
        info!("manual: {} {:?} for {:?}", step.name(), step.sticks.channels(), step.duration());
        if step.ramp_to.is_none() {
            return self.guard(sticks.hold(step.sticks, step.duration())).await;
        }
        let ticks = (step.duration().as_millis() / cadence.as_millis().max(1)).max(1) as u32;
        for i in 0..ticks {
            self.guard(sticks.hold(step.packet_at(i, ticks), cadence)).await?;
        }
        Ok(())
    }

    /// Mode changes are fire-and-forget; the heartbeat tells whether they
    /// stuck, and a mode that never shows up is only logged. Only heartbeats
    /// received after the request count. Returns whether one confirmed it.
    async fn request_mode(&self, mode: u32) -> Result<bool, MissionError> {
        let mut hb = self.session.monitor().subscribe();
        hb.borrow_and_update();
        self.session.dispatcher().set_mode(mode)?;

        let settle = self.cfg.mode_settle();
        let confirm = tokio::time::timeout(settle, async move {
            while hb.changed().await.is_ok() {
                if hb.borrow_and_update().as_ref().is_some_and(|s| s.custom_mode == mode) {
                    return true;
                }
            }
            false
        });
        let confirmed = matches!(self.guard(confirm).await?, Ok(true));
        if confirmed {
            info!("mission: vehicle in custom mode {}", mode);
        } else {
            warn!("mission: custom mode {} not reported within {:?}, continuing", mode, settle);
        }
        Ok(confirmed)
    }

    async fn command(&self, cmd: Command) -> Result<(), MissionError> {
        match self.guard(self.session.dispatcher().dispatch(cmd)).await?? {
            CommandResult::Accepted => Ok(()),
            CommandResult::Rejected(code) => Err(MissionError::CommandRejected { command: cmd, code }),
            CommandResult::TimedOut => Err(MissionError::CommandTimeout { command: cmd }),
        }
    }

    /// Runs `fut` unless the link is declared lost first.
    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, MissionError> {
        tokio::select! {
            biased;
            _ = self.session.monitor().lost() => Err(MissionError::LinkLost),
            out = fut => Ok(out),
        }
    }

    fn require_phase(&self, expected: FlightPhase) -> Result<(), MissionError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(MissionError::InvalidPhase { expected, actual: self.phase })
        }
    }

    fn refused(&self, e: MissionError) -> MissionOutcome {
        warn!("mission: not started: {}", e);
        MissionOutcome { cause: Some(e), ..self.outcome() }
    }

    fn transition(&mut self, next: FlightPhase) -> Result<(), MissionError> {
        if !self.phase.can_transition_to(next) {
            return Err(MissionError::InvalidTransition { from: self.phase, to: next });
        }
        self.record(next);
        Ok(())
    }

    fn record(&mut self, next: FlightPhase) {
        let at_unix_ms = (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        info!("phase: {:?} -> {:?}", self.phase, next);
        self.transitions.push(PhaseTransition { from: self.phase, to: next, at_unix_ms });
        self.phase = next;
    }

    async fn finish(&mut self, res: Result<(), MissionError>) -> MissionOutcome {
        match res {
            Ok(()) => info!("mission: complete, vehicle disarmed"),
            Err(cause) => self.fail(cause).await,
        }
        self.outcome()
    }

    async fn fail(&mut self, cause: MissionError) {
        let from = self.phase;
        warn!("mission: failed in {:?}: {}", from, cause);
        self.drop_sticks().await;
        if !self.phase.is_terminal() {
            self.record(FlightPhase::Failed);
        }

        let link_up = !cause.is_link_loss() && self.session.status() == LinkStatus::Connected;
        self.cause = Some(cause);
        if !link_up {
            warn!("mission: link down, no LAND/DISARM possible");
            return;
        }
        self.unwind(from).await;
    }

    /// Armed but off the ground counts as airborne: a TAKEOFF whose ack got
    /// lost, or telemetry above the landed threshold.
    fn maybe_airborne(&self) -> bool {
        let threshold = self.cfg.landed_threshold_m();
        self.climb_requested
            || self.session.telemetry().latest_position().is_some_and(|p| p.relative_alt_m > threshold)
    }

    async fn unwind(&self, from: FlightPhase) {
        let from = match from {
            FlightPhase::Armed if self.maybe_airborne() => FlightPhase::TakingOff,
            other => other,
        };
        match from {
            FlightPhase::TakingOff | FlightPhase::Airborne | FlightPhase::ManualOverride => {
                info!("unwind: LAND + DISARM");
                match self.command(Command::Land).await {
                    Ok(()) => {
                        if let Err(e) = self.wait_landed().await {
                            warn!("unwind: {}", e);
                        }
                    }
                    Err(e) => warn!("unwind: LAND failed: {}", e),
                }
                self.unwind_disarm().await;
            }
            FlightPhase::Armed | FlightPhase::Landing => self.unwind_disarm().await,
            _ => debug!("unwind: nothing to do from {:?}", from),
        }
    }

    async fn unwind_disarm(&self) {
        match self.command(Command::Disarm).await {
            Ok(()) => info!("unwind: disarmed"),
            Err(e) => warn!("unwind: DISARM failed: {}", e),
        }
    }

    async fn drop_sticks(&mut self) {
        if let Some(mut sticks) = self.sticks.take() {
            if let Err(e) = sticks.release() {
                warn!("mission: could not release override: {}", e);
            }
            sticks.end().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MODE_GUIDED;
    use mavlink::common::{MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};
    use swarm_fc::link::{Link, VehicleEnd};
    use FlightPhase::*;

    fn t(from: FlightPhase, to: FlightPhase) -> PhaseTransition {
        PhaseTransition { from, to, at_unix_ms: 0 }
    }

    #[test]
    fn outcome_path_and_display() {
        let outcome = MissionOutcome {
            phase: Failed,
            cause: Some(MissionError::LinkLost),
            transitions: vec![t(Disconnected, Connected), t(Connected, Armed), t(Armed, Failed)],
        };
        assert_eq!(outcome.path(), vec![Disconnected, Connected, Armed, Failed]);
        assert!(!outcome.succeeded());
        assert_eq!(
            outcome.to_string(),
            "Failed [Disconnected -> Connected -> Armed -> Failed]: link to vehicle lost"
        );
    }

    #[test]
    fn disarmed_without_cause_is_success() {
        let outcome = MissionOutcome { phase: Disarmed, cause: None, transitions: vec![t(Landing, Disarmed)] };
        assert!(outcome.succeeded());
    }

    fn heartbeat(custom_mode: u32) -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        })
    }

    async fn attached(custom_mode: u32) -> (FlightController, VehicleEnd) {
        let (link, mut vehicle) = Link::loopback(1, 1);
        vehicle.send(heartbeat(custom_mode)).unwrap();
        let session = Session::attach(link, &LinkConfig::default()).await.unwrap();
        (FlightController::new(session, MissionConfig::default()), vehicle)
    }

    #[tokio::test(start_paused = true)]
    async fn stale_heartbeat_does_not_confirm_mode() {
        let (ctl, _vehicle) = attached(MODE_GUIDED).await;
        assert!(!ctl.request_mode(MODE_GUIDED).await.unwrap());
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_heartbeat_confirms_mode() {
        let (ctl, mut vehicle) = attached(0).await;
        let vehicle_side = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            vehicle.send(heartbeat(MODE_GUIDED)).unwrap();
        };
        let (confirmed, _) = tokio::join!(ctl.request_mode(MODE_GUIDED), vehicle_side);
        assert!(confirmed.unwrap());

        let requested = vehicle.drain().into_iter().any(|m| {
            matches!(m, MavMessage::COMMAND_LONG(c) if c.command == MavCmd::MAV_CMD_DO_SET_MODE && c.param2 == MODE_GUIDED as f32)
        });
        assert!(requested);
        ctl.shutdown().await;
    }
}
