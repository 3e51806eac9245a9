pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod heartbeat;
pub mod link;
pub mod rc_override;
pub mod session;
pub mod telemetry;

use std::time::Duration;

use serde::Deserialize;

pub use error::{ConnectionError, DispatchError, LinkLost, TelemetryTimeout};
pub use session::Session;

pub const DEFAULT_ENDPOINT: &str = "tcp:127.0.0.1:5760";

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// `tcp:HOST:PORT`, `udp:HOST:PORT` or `serial:DEVICE:BAUD`.
    /// ArduPilot SITL listens on tcp:127.0.0.1:5760.
    pub endpoint: String,

    /// MAVLink ids we use (ground side). 255/190 is the usual GCS pair.
    pub sys_id: Option<u8>,
    pub comp_id: Option<u8>,

    /// Transport connect deadline.
    pub connect_timeout_ms: Option<u64>,

    /// Wait for the first vehicle heartbeat after the transport is up.
    pub heartbeat_timeout_ms: Option<u64>,

    /// Nominal vehicle heartbeat period; the liveness window is 3x this.
    pub heartbeat_period_ms: Option<u64>,

    /// How long to wait for COMMAND_ACK before resending.
    pub ack_window_ms: Option<u64>,

    /// Resends after the first attempt. 1 unless you know better.
    pub command_retries: Option<u8>,

    /// Our own heartbeat rate towards the vehicle. Default 1 Hz.
    pub send_heartbeat_hz: Option<f32>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            sys_id: None,
            comp_id: None,
            connect_timeout_ms: None,
            heartbeat_timeout_ms: None,
            heartbeat_period_ms: None,
            ack_window_ms: None,
            command_retries: None,
            send_heartbeat_hz: None,
        }
    }
}

impl LinkConfig {
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), ..Self::default() }
    }

    pub fn sys_id(&self) -> u8 {
        self.sys_id.unwrap_or(255)
    }

    pub fn comp_id(&self) -> u8 {
        self.comp_id.unwrap_or(190)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(15_000))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.unwrap_or(15_000))
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms.unwrap_or(1_000))
    }

    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_period() * 3
    }

    pub fn ack_window(&self) -> Duration {
        Duration::from_millis(self.ack_window_ms.unwrap_or(3_000))
    }

    pub fn command_retries(&self) -> u8 {
        self.command_retries.unwrap_or(1)
    }

    pub fn send_heartbeat_interval(&self) -> Duration {
        let hz = self.send_heartbeat_hz.unwrap_or(1.0).max(0.2);
        Duration::from_secs_f32(1.0 / hz)
    }
}
