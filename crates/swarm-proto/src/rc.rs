use serde::{Deserialize, Serialize};

pub const AXIS_MIN: u16 = 1000;
pub const AXIS_MAX: u16 = 2000;
pub const AXIS_CENTER: u16 = 1500;
/// Axis value meaning "no override on this axis".
pub const AXIS_RELEASE: u16 = 0;

/// One RC_CHANNELS_OVERRIDE worth of stick values.
///
/// Each axis is either in `[AXIS_MIN, AXIS_MAX]` or `AXIS_RELEASE`. A packet with
/// all four axes released hands control back to the autopilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OverridePacket {
    pub roll: u16,
    pub pitch: u16,
    pub throttle: u16,
    pub yaw: u16,
}

impl OverridePacket {
    pub const RELEASE: OverridePacket = OverridePacket {
        roll: AXIS_RELEASE,
        pitch: AXIS_RELEASE,
        throttle: AXIS_RELEASE,
        yaw: AXIS_RELEASE,
    };

    /// Builds a packet, clamping every non-zero axis into `[1000, 2000]`.
    pub fn new(roll: u16, pitch: u16, throttle: u16, yaw: u16) -> Self {
        Self {
            roll: clamp_axis(roll),
            pitch: clamp_axis(pitch),
            throttle: clamp_axis(throttle),
            yaw: clamp_axis(yaw),
        }
    }

    pub fn is_release(&self) -> bool {
        *self == Self::RELEASE
    }

    pub fn channels(&self) -> [u16; 4] {
        [self.roll, self.pitch, self.throttle, self.yaw]
    }
}

pub fn clamp_axis(v: u16) -> u16 {
    if v == AXIS_RELEASE { AXIS_RELEASE } else { v.clamp(AXIS_MIN, AXIS_MAX) }
}
