use anyhow::{Context, Result};
use swarm_fc::link::Endpoint;
use swarm_fc::LinkConfig;
use swarm_proto::rc::{AXIS_MAX, AXIS_MIN, AXIS_RELEASE};

use crate::manual::ManualStep;
use crate::MissionConfig;

pub fn check_link(cfg: &LinkConfig) -> Result<Endpoint> {
    let endpoint: Endpoint = cfg.endpoint.parse().context("link.endpoint")?;
    anyhow::ensure!(cfg.sys_id() != 0, "link.sys_id must be non-zero");
    anyhow::ensure!(!cfg.heartbeat_period().is_zero(), "link.heartbeat_period_ms must be > 0");
    anyhow::ensure!(!cfg.ack_window().is_zero(), "link.ack_window_ms must be > 0");
    anyhow::ensure!(cfg.command_retries() <= 5, "link.command_retries should be 0..5");
    Ok(endpoint)
}

pub fn check_mission(cfg: &MissionConfig) -> Result<()> {
    let alt = cfg.altitude_m();
    anyhow::ensure!(alt > 0.5 && alt <= 120.0, "mission.altitude_m should be 0.5..120");
    let f = cfg.takeoff_fraction();
    anyhow::ensure!(f > 0.0 && f <= 1.0, "mission.takeoff_fraction should be in (0, 1]");
    anyhow::ensure!(
        cfg.landed_threshold_m() >= 0.0 && cfg.landed_threshold_m() < alt * f,
        "mission.landed_threshold_m must be below the takeoff altitude"
    );
    anyhow::ensure!(!cfg.takeoff_timeout().is_zero(), "mission.takeoff_timeout_ms must be > 0");
    anyhow::ensure!(!cfg.land_timeout().is_zero(), "mission.land_timeout_ms must be > 0");

    let cadence = cfg.override_cadence().as_millis();
    // the autopilot drops an override it has not heard for ~1 s
    anyhow::ensure!((20..=500).contains(&cadence), "mission.override_cadence_ms should be 20..500");

    if let Some(script) = &cfg.cruise_script {
        check_script(script)?;
    }
    Ok(())
}

pub fn check_script(script: &[ManualStep]) -> Result<()> {
    anyhow::ensure!(!script.is_empty(), "manual script is empty");
    for (i, step) in script.iter().enumerate() {
        anyhow::ensure!(step.duration_ms > 0, "step {} ({}) has zero duration", i, step.name());
        let mut axes = step.sticks.channels().to_vec();
        if let Some(to) = step.ramp_to {
            axes.extend(to.channels());
        }
        for v in axes {
            anyhow::ensure!(
                v == AXIS_RELEASE || (AXIS_MIN..=AXIS_MAX).contains(&v),
                "step {} ({}) axis value {} outside {}..{}",
                i,
                step.name(),
                v,
                AXIS_MIN,
                AXIS_MAX
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manual;
    use swarm_proto::rc::OverridePacket;

    #[test]
    fn defaults_and_presets_pass() {
        check_link(&LinkConfig::default()).unwrap();
        check_mission(&MissionConfig::default()).unwrap();
        check_script(&manual::direct()).unwrap();
        check_script(&manual::dramatic()).unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let cfg = MissionConfig { takeoff_fraction: Some(1.5), ..Default::default() };
        assert!(check_mission(&cfg).is_err());

        let cfg = MissionConfig { override_cadence_ms: Some(2_000), ..Default::default() };
        assert!(check_mission(&cfg).is_err());

        let bad = ManualStep {
            label: None,
            sticks: OverridePacket { roll: 1500, pitch: 2500, throttle: 1500, yaw: 1500 },
            ramp_to: None,
            duration_ms: 100,
        };
        assert!(check_script(&[bad]).is_err());
        assert!(check_script(&[]).is_err());

        assert!(check_link(&LinkConfig::for_endpoint("carrier-pigeon:1")).is_err());
        let link = LinkConfig { ack_window_ms: Some(0), ..LinkConfig::default() };
        assert!(check_link(&link).is_err());
    }
}
