use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryKind {
    Attitude,
    GlobalPosition,
    RcChannels,
    Battery,
}

impl TelemetryKind {
    pub const ALL: [TelemetryKind; 4] = [
        TelemetryKind::Attitude,
        TelemetryKind::GlobalPosition,
        TelemetryKind::RcChannels,
        TelemetryKind::Battery,
    ];

    pub fn index(self) -> usize {
        match self {
            TelemetryKind::Attitude => 0,
            TelemetryKind::GlobalPosition => 1,
            TelemetryKind::RcChannels => 2,
            TelemetryKind::Battery => 3,
        }
    }
}

/// Radians, as reported by ATTITUDE.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalPosition {
    pub relative_alt_m: f32,
    pub vx_mps: f32,
    pub vy_mps: f32,
}

impl GlobalPosition {
    pub fn ground_speed_mps(&self) -> f32 {
        (self.vx_mps * self.vx_mps + self.vy_mps * self.vy_mps).sqrt()
    }
}

/// First four raw RC inputs (roll, pitch, throttle, yaw on a default map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcChannels {
    pub raw: [u16; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub voltage: Option<f32>,      // Volts
    pub current: Option<f32>,      // Amps
    pub remaining: Option<u8>,     // Percent 0-100
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TelemetrySample {
    Attitude(Attitude),
    GlobalPosition(GlobalPosition),
    RcChannels(RcChannels),
    Battery(BatteryStatus),
}

impl TelemetrySample {
    pub fn kind(&self) -> TelemetryKind {
        match self {
            TelemetrySample::Attitude(_) => TelemetryKind::Attitude,
            TelemetrySample::GlobalPosition(_) => TelemetryKind::GlobalPosition,
            TelemetrySample::RcChannels(_) => TelemetryKind::RcChannels,
            TelemetrySample::Battery(_) => TelemetryKind::Battery,
        }
    }

    /// Relative altitude in meters, for position samples only.
    pub fn relative_alt_m(&self) -> Option<f32> {
        match self {
            TelemetrySample::GlobalPosition(p) => Some(p.relative_alt_m),
            _ => None,
        }
    }
}
