use std::time::Duration;

use swarm_proto::telemetry::{TelemetryKind, TelemetrySample};
use tracing::{info, warn};

use crate::dispatch::{Command, CommandResult};
use crate::error::DispatchError;
use crate::heartbeat::HeartbeatSample;
use crate::link::LinkStatus;
use crate::session::Session;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounts {
    pub heartbeats: u64,
    pub attitude: u64,
    pub position: u64,
    pub rc_channels: u64,
    pub battery: u64,
}

impl TrafficCounts {
    fn snapshot(session: &Session) -> Self {
        let t = session.telemetry();
        Self {
            heartbeats: session.monitor().heartbeats_received(),
            attitude: t.count(TelemetryKind::Attitude),
            position: t.count(TelemetryKind::GlobalPosition),
            rc_channels: t.count(TelemetryKind::RcChannels),
            battery: t.count(TelemetryKind::Battery),
        }
    }

    fn since(self, earlier: Self) -> Self {
        Self {
            heartbeats: self.heartbeats - earlier.heartbeats,
            attitude: self.attitude - earlier.attitude,
            position: self.position - earlier.position,
            rc_channels: self.rc_channels - earlier.rc_channels,
            battery: self.battery - earlier.battery,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub target: (u8, u8),
    pub window: Duration,
    pub traffic: TrafficCounts,
    pub status: LinkStatus,
    pub last_heartbeat: Option<HeartbeatSample>,
    pub last_attitude: Option<TelemetrySample>,
    pub last_position: Option<TelemetrySample>,
    pub last_rc: Option<TelemetrySample>,
    pub last_battery: Option<TelemetrySample>,
    pub arm_probe: Option<Result<CommandResult, DispatchError>>,
}

impl DiagnosticsReport {
    /// Attitude updates mean the autopilot is being fed by a simulator or IMU.
    pub fn attitude_flowing(&self) -> bool {
        self.traffic.attitude > 0
    }
}

/// Watches the link for `window` and reports what arrived.
///
/// With `arm_probe` the vehicle is asked to arm once; if it accepts, it is
/// disarmed again straight away.
pub async fn diagnose(session: &Session, window: Duration, arm_probe: bool) -> DiagnosticsReport {
    let before = TrafficCounts::snapshot(session);
    tokio::time::sleep(window).await;
    let traffic = TrafficCounts::snapshot(session).since(before);
    info!(
        "diag: {:?} window: hb={} att={} pos={} rc={} batt={}",
        window, traffic.heartbeats, traffic.attitude, traffic.position, traffic.rc_channels, traffic.battery
    );

    let arm_probe = if arm_probe {
        let res = session.dispatcher().dispatch(Command::Arm).await;
        info!("diag: arm probe -> {:?}", res);
        if let Ok(CommandResult::Accepted) = res {
            match session.dispatcher().dispatch(Command::Disarm).await {
                Ok(CommandResult::Accepted) => info!("diag: disarmed after probe"),
                other => warn!("diag: disarm after probe failed: {:?}", other),
            }
        }
        Some(res)
    } else {
        None
    };

    let t = session.telemetry();
    DiagnosticsReport {
        target: session.target(),
        window,
        traffic,
        status: session.status(),
        last_heartbeat: session.monitor().latest(),
        last_attitude: t.latest(TelemetryKind::Attitude),
        last_position: t.latest(TelemetryKind::GlobalPosition),
        last_rc: t.latest(TelemetryKind::RcChannels),
        last_battery: t.latest(TelemetryKind::Battery),
        arm_probe,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use crate::LinkConfig;
    use mavlink::common::{
        MavAutopilot, MavMessage, MavModeFlag, MavResult, MavState, MavType, ATTITUDE_DATA,
        COMMAND_ACK_DATA, COMMAND_LONG_DATA, HEARTBEAT_DATA,
    };

    fn heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn counts_traffic_and_probes_arm() {
        let (link, mut vehicle) = Link::loopback(1, 1);
        vehicle.send(heartbeat()).unwrap();
        let session = Session::attach(link, &LinkConfig::default()).await.unwrap();

        let mut tx = vehicle.sender();
        tokio::spawn(async move {
            for i in 0..40 {
                if i % 10 == 0 && tx.send(heartbeat()).is_err() {
                    break;
                }
                let _ = tx.send(MavMessage::ATTITUDE(ATTITUDE_DATA { roll: 0.01 * i as f32, ..Default::default() }));
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        // ack every COMMAND_LONG with ACCEPTED
        let mut acks = vehicle.sender();
        tokio::spawn(async move {
            while let Some(msg) = vehicle.recv().await {
                if let MavMessage::COMMAND_LONG(COMMAND_LONG_DATA { command, .. }) = msg {
                    let _ = acks.send(MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
                        command,
                        result: MavResult::MAV_RESULT_ACCEPTED,
                        ..Default::default()
                    }));
                }
            }
        });

        let report = diagnose(&session, Duration::from_secs(2), true).await;
        assert!(report.attitude_flowing());
        assert!(report.traffic.heartbeats >= 2);
        assert!(report.traffic.position == 0);
        assert_eq!(report.arm_probe, Some(Ok(CommandResult::Accepted)));
        assert!(!session.dispatcher().is_pending(crate::dispatch::CommandKind::ArmDisarm));
        assert_eq!(
            report.last_attitude.map(|s| s.kind()),
            Some(TelemetryKind::Attitude)
        );
        session.shutdown().await;
    }
}
