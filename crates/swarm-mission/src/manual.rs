use std::time::Duration;

use serde::{Deserialize, Serialize};
use swarm_proto::rc::{OverridePacket, AXIS_CENTER};

/// One segment of a manual stick script.
///
/// Without `ramp_to` the sticks hold `sticks` for the whole duration. With it,
/// every axis moves linearly from `sticks` towards `ramp_to`, one step per
/// override tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualStep {
    #[serde(default)]
    pub label: Option<String>,
    pub sticks: OverridePacket,
    #[serde(default)]
    pub ramp_to: Option<OverridePacket>,
    pub duration_ms: u64,
}

impl ManualStep {
    pub fn hold(label: &str, roll: u16, pitch: u16, throttle: u16, yaw: u16, duration_ms: u64) -> Self {
        Self {
            label: Some(label.to_string()),
            sticks: OverridePacket::new(roll, pitch, throttle, yaw),
            ramp_to: None,
            duration_ms,
        }
    }

    pub fn ramp(mut self, roll: u16, pitch: u16, throttle: u16, yaw: u16) -> Self {
        self.ramp_to = Some(OverridePacket::new(roll, pitch, throttle, yaw));
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn name(&self) -> &str {
        self.label.as_deref().unwrap_or("step")
    }

    /// Sticks for tick `i` of `n`. The last tick lands exactly on `ramp_to`.
    pub fn packet_at(&self, i: u32, n: u32) -> OverridePacket {
        let Some(to) = self.ramp_to else { return self.sticks };
        let (num, den) = if n <= 1 { (1, 1) } else { (i.min(n - 1) as i64, (n - 1) as i64) };
        let lerp = |a: u16, b: u16| {
            if a == 0 || b == 0 {
                return a;
            }
            let v = a as i64 + (b as i64 - a as i64) * num / den;
            v as u16
        };
        OverridePacket::new(
            lerp(self.sticks.roll, to.roll),
            lerp(self.sticks.pitch, to.pitch),
            lerp(self.sticks.throttle, to.throttle),
            lerp(self.sticks.yaw, to.yaw),
        )
    }
}

pub fn script_duration(script: &[ManualStep]) -> Duration {
    script.iter().map(ManualStep::duration).sum()
}

const C: u16 = AXIS_CENTER;

/// Gentle hover, forward, turn, center and throttle-down.
pub fn direct() -> Vec<ManualStep> {
    vec![
        ManualStep::hold("hover", C, C, 1600, C, 3_000),
        ManualStep::hold("forward", C, 1600, 1600, C, 2_000),
        ManualStep::hold("turn right", C, C, 1600, 1600, 2_000),
        ManualStep::hold("center", C, C, 1600, C, 1_000),
        ManualStep::hold("descend", C, C, 1600, C, 2_000).ramp(C, C, 1400, C),
    ]
}

/// Large, easy to see movements.
pub fn dramatic() -> Vec<ManualStep> {
    vec![
        ManualStep::hold("liftoff", C, C, 1900, C, 5_000),
        ManualStep::hold("forward", C, 1800, 1700, C, 3_000),
        ManualStep::hold("roll right", 1800, C, 1700, C, 3_000),
        ManualStep::hold("roll left", 1200, C, 1700, C, 3_000),
        ManualStep::hold("yaw spin", C, C, 1700, C, 3_000).ramp(C, C, 1700, 1900),
        ManualStep::hold("center", C, C, 1700, C, 2_000),
        ManualStep::hold("descent", C, C, 1700, C, 3_000).ramp(C, C, 1000, C),
    ]
}

pub const PRESETS: &[&str] = &["direct", "dramatic"];

pub fn preset(name: &str) -> Option<Vec<ManualStep>> {
    match name {
        "direct" => Some(direct()),
        "dramatic" => Some(dramatic()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_resolve_by_name() {
        for name in PRESETS {
            assert!(preset(name).is_some_and(|s| !s.is_empty()), "{}", name);
        }
        assert!(preset("barrel-roll").is_none());
        assert_eq!(script_duration(&direct()), Duration::from_secs(10));
        assert_eq!(script_duration(&dramatic()), Duration::from_secs(22));
    }

    #[test]
    fn ramp_interpolates_per_tick() {
        let step = ManualStep::hold("descend", C, C, 1600, C, 2_000).ramp(C, C, 1400, C);
        assert_eq!(step.packet_at(0, 20).throttle, 1600);
        assert_eq!(step.packet_at(1, 20).throttle, 1590);
        assert_eq!(step.packet_at(10, 20).throttle, 1495);
        assert_eq!(step.packet_at(19, 20).throttle, 1400);
        assert_eq!(step.packet_at(5, 20).roll, C);
        assert_eq!(step.packet_at(0, 1).throttle, 1400);
    }

    #[test]
    fn ramps_end_on_their_target() {
        let descent = dramatic().pop().unwrap();
        assert_eq!(descent.packet_at(29, 30).throttle, 1000);
        let spin = &dramatic()[4];
        assert_eq!(spin.packet_at(29, 30).yaw, 1900);
        assert_eq!(spin.packet_at(29, 30).throttle, 1700);
    }

    #[test]
    fn hold_ignores_tick() {
        let step = ManualStep::hold("hover", C, C, 1600, C, 3_000);
        assert_eq!(step.packet_at(7, 30), step.sticks);
    }

    #[test]
    fn released_axis_is_not_ramped() {
        let step = ManualStep::hold("x", 0, C, 1600, C, 1_000).ramp(1800, C, 1600, C);
        assert_eq!(step.packet_at(5, 10).roll, 0);
    }

    #[test]
    fn steps_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            steps: Vec<ManualStep>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[steps]]
            label = "climb"
            sticks = { roll = 1500, pitch = 1500, throttle = 1700, yaw = 1500 }
            duration_ms = 1500

            [[steps]]
            sticks = { roll = 1500, pitch = 1500, throttle = 1700, yaw = 1500 }
            ramp_to = { roll = 1500, pitch = 1500, throttle = 1100, yaw = 1500 }
            duration_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(doc.steps.len(), 2);
        assert_eq!(doc.steps[0].name(), "climb");
        assert_eq!(doc.steps[1].name(), "step");
        assert_eq!(doc.steps[1].ramp_to.unwrap().throttle, 1100);
    }
}
