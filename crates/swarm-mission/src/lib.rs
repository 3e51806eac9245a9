pub mod controller;
pub mod doctor;
pub mod error;
pub mod manual;

use std::time::Duration;

use serde::Deserialize;

pub use controller::{FlightController, MissionOutcome};
pub use error::MissionError;
pub use manual::ManualStep;

/// ArduCopter custom modes we ask for.
pub const MODE_STABILIZE: u32 = 0;
pub const MODE_GUIDED: u32 = 4;

/// `[mission]` section. Unset fields fall back to the accessor defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MissionConfig {
    /// Takeoff target for `fly` when the command line does not give one.
    pub altitude_m: Option<f32>,

    /// Airborne once relative altitude reaches this share of the target.
    pub takeoff_fraction: Option<f32>,
    pub takeoff_timeout_ms: Option<u64>,

    /// Custom mode requested before TAKEOFF (4 = GUIDED on ArduCopter).
    pub takeoff_mode: Option<u32>,

    pub cruise_duration_ms: Option<u64>,
    /// Sticks flown between takeoff and LAND instead of plain monitoring.
    pub cruise_script: Option<Vec<ManualStep>>,

    pub landed_threshold_m: Option<f32>,
    pub land_timeout_ms: Option<u64>,

    /// Custom mode for manual flight, STABILIZE unless set.
    pub manual_mode: Option<u32>,
    /// Set false to fly manual scripts in whatever mode the vehicle is in.
    pub request_manual_mode: Option<bool>,

    /// How long to watch heartbeats for a requested mode to show up.
    pub mode_settle_ms: Option<u64>,

    pub override_cadence_ms: Option<u64>,
    /// Pause after releasing the sticks before the next command.
    pub release_settle_ms: Option<u64>,
}

impl MissionConfig {
    pub fn altitude_m(&self) -> f32 {
        self.altitude_m.unwrap_or(5.0)
    }

    pub fn takeoff_fraction(&self) -> f32 {
        self.takeoff_fraction.unwrap_or(0.9)
    }

    pub fn takeoff_timeout(&self) -> Duration {
        Duration::from_millis(self.takeoff_timeout_ms.unwrap_or(30_000))
    }

    pub fn takeoff_mode(&self) -> Option<u32> {
        self.takeoff_mode
    }

    pub fn cruise_duration(&self) -> Duration {
        Duration::from_millis(self.cruise_duration_ms.unwrap_or(15_000))
    }

    pub fn landed_threshold_m(&self) -> f32 {
        self.landed_threshold_m.unwrap_or(0.2)
    }

    pub fn land_timeout(&self) -> Duration {
        Duration::from_millis(self.land_timeout_ms.unwrap_or(30_000))
    }

    pub fn manual_mode(&self) -> Option<u32> {
        if self.request_manual_mode == Some(false) {
            return None;
        }
        Some(self.manual_mode.unwrap_or(MODE_STABILIZE))
    }

    pub fn mode_settle(&self) -> Duration {
        Duration::from_millis(self.mode_settle_ms.unwrap_or(2_000))
    }

    pub fn override_cadence(&self) -> Duration {
        Duration::from_millis(self.override_cadence_ms.unwrap_or(100))
    }

    pub fn release_settle(&self) -> Duration {
        Duration::from_millis(self.release_settle_ms.unwrap_or(1_000))
    }
}

/// `[manual]` section: a named preset or explicit steps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualConfig {
    pub preset: Option<String>,
    pub steps: Option<Vec<ManualStep>>,
}

impl ManualConfig {
    /// Explicit steps win over the preset; neither means `direct`.
    pub fn script(&self) -> anyhow::Result<Vec<ManualStep>> {
        if let Some(steps) = &self.steps {
            return Ok(steps.clone());
        }
        let name = self.preset.as_deref().unwrap_or("direct");
        manual::preset(name)
            .ok_or_else(|| anyhow::anyhow!("unknown manual preset {:?} (have {:?})", name, manual::PRESETS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = MissionConfig::default();
        assert_eq!(cfg.takeoff_fraction(), 0.9);
        assert_eq!(cfg.landed_threshold_m(), 0.2);
        assert_eq!(cfg.manual_mode(), Some(MODE_STABILIZE));
        assert_eq!(cfg.takeoff_mode(), None);
        assert_eq!(cfg.override_cadence(), Duration::from_millis(100));
    }

    #[test]
    fn manual_mode_can_be_skipped() {
        let cfg = MissionConfig { request_manual_mode: Some(false), manual_mode: Some(2), ..Default::default() };
        assert_eq!(cfg.manual_mode(), None);
    }

    #[test]
    fn manual_script_resolution() {
        assert_eq!(ManualConfig::default().script().unwrap(), manual::direct());
        let cfg = ManualConfig { preset: Some("dramatic".into()), steps: None };
        assert_eq!(cfg.script().unwrap(), manual::dramatic());
        let cfg = ManualConfig { preset: Some("loop".into()), steps: None };
        assert!(cfg.script().is_err());
    }

    #[test]
    fn mission_section_parses() {
        let cfg: MissionConfig = toml::from_str(
            r#"
            altitude_m = 10.0
            takeoff_mode = 4
            cruise_duration_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.altitude_m(), 10.0);
        assert_eq!(cfg.takeoff_mode(), Some(MODE_GUIDED));
        assert_eq!(cfg.cruise_duration(), Duration::from_secs(5));
    }
}
