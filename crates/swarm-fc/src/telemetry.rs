use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mavlink::common::{MavMessage, SYS_STATUS_DATA};
use swarm_proto::telemetry::{
    Attitude, BatteryStatus, GlobalPosition, RcChannels, TelemetryKind, TelemetrySample,
};
use tokio::sync::watch;
use tracing::debug;

use crate::error::TelemetryTimeout;

/// Latest-value store for streamed telemetry, one slot per kind.
///
/// Written by the receive loop, read by the foreground. No history is kept.
pub struct TelemetryReader {
    slots: [watch::Sender<Option<TelemetrySample>>; 4],
    counts: [AtomicU64; 4],
}

impl Default for TelemetryReader {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryReader {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| watch::channel(None).0),
            counts: Default::default(),
        }
    }

    /// Converts and stores a telemetry message. Returns false for anything
    /// that is not telemetry.
    pub fn ingest(&self, msg: &MavMessage) -> bool {
        let sample = match msg {
            MavMessage::ATTITUDE(a) => TelemetrySample::Attitude(Attitude {
                roll: a.roll,
                pitch: a.pitch,
                yaw: a.yaw,
            }),
            // relative_alt is mm, velocities cm/s
            MavMessage::GLOBAL_POSITION_INT(p) => TelemetrySample::GlobalPosition(GlobalPosition {
                relative_alt_m: p.relative_alt as f32 / 1000.0,
                vx_mps: p.vx as f32 / 100.0,
                vy_mps: p.vy as f32 / 100.0,
            }),
            MavMessage::RC_CHANNELS(rc) => TelemetrySample::RcChannels(RcChannels {
                raw: [rc.chan1_raw, rc.chan2_raw, rc.chan3_raw, rc.chan4_raw],
            }),
            MavMessage::SYS_STATUS(status) => TelemetrySample::Battery(self.merge_battery(status)),
            _ => return false,
        };
        self.publish(sample);
        true
    }

    pub fn publish(&self, sample: TelemetrySample) {
        let i = sample.kind().index();
        self.slots[i].send_replace(Some(sample));
        self.counts[i].fetch_add(1, Ordering::Relaxed);
    }

    pub fn latest(&self, kind: TelemetryKind) -> Option<TelemetrySample> {
        *self.slots[kind.index()].borrow()
    }

    pub fn latest_position(&self) -> Option<GlobalPosition> {
        match self.latest(TelemetryKind::GlobalPosition) {
            Some(TelemetrySample::GlobalPosition(p)) => Some(p),
            _ => None,
        }
    }

    pub fn latest_battery(&self) -> Option<BatteryStatus> {
        match self.latest(TelemetryKind::Battery) {
            Some(TelemetrySample::Battery(b)) => Some(b),
            _ => None,
        }
    }

    /// Samples of `kind` received so far.
    pub fn count(&self, kind: TelemetryKind) -> u64 {
        self.counts[kind.index()].load(Ordering::Relaxed)
    }

    /// Waits until the latest `kind` sample satisfies `predicate`.
    ///
    /// Checks the current sample first, then every update. Resolves with
    /// `TelemetryTimeout` once `timeout` has elapsed.
    pub async fn poll_until<F>(
        &self,
        kind: TelemetryKind,
        mut predicate: F,
        timeout: Duration,
    ) -> Result<TelemetrySample, TelemetryTimeout>
    where
        F: FnMut(&TelemetrySample) -> bool,
    {
        let mut rx = self.slots[kind.index()].subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.as_ref().is_some_and(&mut predicate))
                .await
                .ok()
                .and_then(|s| *s)
        })
        .await;

        match waited {
            Ok(Some(sample)) => Ok(sample),
            _ => {
                debug!("telemetry: {:?} condition not met within {:?}", kind, timeout);
                Err(TelemetryTimeout { kind, waited: timeout })
            }
        }
    }

    pub async fn wait_altitude_at_least(&self, meters: f32, timeout: Duration) -> Result<f32, TelemetryTimeout> {
        self.poll_until(
            TelemetryKind::GlobalPosition,
            |s| s.relative_alt_m().is_some_and(|alt| alt >= meters),
            timeout,
        )
        .await
        .map(|s| s.relative_alt_m().unwrap_or(meters))
    }

    pub async fn wait_altitude_at_most(&self, meters: f32, timeout: Duration) -> Result<f32, TelemetryTimeout> {
        self.poll_until(
            TelemetryKind::GlobalPosition,
            |s| s.relative_alt_m().is_some_and(|alt| alt <= meters),
            timeout,
        )
        .await
        .map(|s| s.relative_alt_m().unwrap_or(meters))
    }

    // Invalid fields keep the previous reading.
    fn merge_battery(&self, status: &SYS_STATUS_DATA) -> BatteryStatus {
        let mut battery = self.latest_battery().unwrap_or_default();
        // voltage_battery is in millivolts, u16::MAX means unknown
        if status.voltage_battery != u16::MAX {
            battery.voltage = Some(status.voltage_battery as f32 / 1000.0);
        }
        // current_battery is in centiamps, -1 means unknown
        if status.current_battery != -1 {
            battery.current = Some(status.current_battery as f32 / 100.0);
        }
        if (0..=100).contains(&status.battery_remaining) {
            battery.remaining = Some(status.battery_remaining as u8);
        }
        battery
    }
}
