use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mavlink::common::{MavModeFlag, MavType, HEARTBEAT_DATA};
use mavlink::MavHeader;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ConnectionError;
use crate::link::{Link, LinkStatus};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatSample {
    pub system_id: u8,
    pub component_id: u8,
    pub base_mode: u8,
    pub system_status: u8,
    pub custom_mode: u32,
    pub received_at: Instant,
}

impl HeartbeatSample {
    pub fn is_armed(&self) -> bool {
        self.base_mode & MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED.bits() != 0
    }

    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

/// Liveness authority for a link.
///
/// Fed by the session's receive loop; everything else asks `is_alive()`.
pub struct HeartbeatMonitor {
    link: Arc<Link>,
    latest: watch::Sender<Option<HeartbeatSample>>,
    liveness_window: Duration,
    received: AtomicU64,
}

impl HeartbeatMonitor {
    pub fn new(link: Arc<Link>, liveness_window: Duration) -> Self {
        let (latest, _) = watch::channel(None);
        Self { link, latest, liveness_window, received: AtomicU64::new(0) }
    }

    pub fn latest(&self) -> Option<HeartbeatSample> {
        *self.latest.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<HeartbeatSample>> {
        self.latest.subscribe()
    }

    pub fn heartbeats_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    pub fn is_alive(&self) -> bool {
        self.link.status() == LinkStatus::Connected
            && self.latest().map(|s| s.age() <= self.liveness_window).unwrap_or(false)
    }

    /// Waits for the vehicle's first heartbeat and returns its (system, component).
    pub async fn await_first_heartbeat(&self, timeout: Duration) -> Result<(u8, u8), ConnectionError> {
        let mut rx = self.latest.subscribe();
        let first = async {
            rx.wait_for(|s| s.is_some()).await.ok().and_then(|s| *s)
        };
        tokio::select! {
            res = tokio::time::timeout(timeout, first) => match res {
                Ok(Some(s)) => Ok((s.system_id, s.component_id)),
                _ => Err(ConnectionError::NoHeartbeat { waited: timeout }),
            },
            _ = self.lost() => Err(ConnectionError::unreachable("link closed before first heartbeat")),
        }
    }

    /// Resolves once the link is Lost.
    pub async fn lost(&self) {
        let mut rx = self.link.subscribe_status();
        let _ = rx.wait_for(|s| *s == LinkStatus::Lost).await;
    }

    /// Returns false when the heartbeat was ignored (GCS traffic, other systems).
    pub(crate) fn on_heartbeat(&self, hdr: &MavHeader, hb: &HEARTBEAT_DATA) -> bool {
        if hb.mavtype == MavType::MAV_TYPE_GCS {
            return false;
        }
        if let Some((sys, _)) = self.link.target() {
            if hdr.system_id != sys {
                return false;
            }
        }

        self.latest.send_replace(Some(HeartbeatSample {
            system_id: hdr.system_id,
            component_id: hdr.component_id,
            base_mode: hb.base_mode.bits(),
            system_status: hb.system_status as u8,
            custom_mode: hb.custom_mode,
            received_at: Instant::now(),
        }));
        self.received.fetch_add(1, Ordering::Relaxed);

        if self.link.status() == LinkStatus::Connecting {
            self.link.set_target(hdr.system_id, hdr.component_id);
            self.link.set_status(LinkStatus::Connected);
            info!(
                "heartbeat: vehicle online sys={} comp={} status={:?}",
                hdr.system_id, hdr.component_id, hb.system_status
            );
        }
        true
    }

    /// Flips the link to Lost when the last heartbeat is older than the window.
    pub(crate) fn check_liveness(&self) -> bool {
        if self.link.status() != LinkStatus::Connected {
            return false;
        }
        let Some(sample) = self.latest() else { return false };
        let age = sample.age();
        if age > self.liveness_window {
            warn!("heartbeat: none for {:?} (window {:?}), link lost", age, self.liveness_window);
            self.link.mark_lost();
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{MavAutopilot, MavState};

    fn hb(mavtype: MavType, base_mode: MavModeFlag) -> HEARTBEAT_DATA {
        HEARTBEAT_DATA {
            custom_mode: 4,
            mavtype,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode,
            system_status: MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        }
    }

    fn hdr(sys: u8) -> MavHeader {
        MavHeader { system_id: sys, component_id: 1, sequence: 0 }
    }

    #[tokio::test(start_paused = true)]
    async fn first_heartbeat_connects_and_sets_target() {
        let (link, _vehicle) = Link::loopback(1, 1);
        let mon = HeartbeatMonitor::new(link.clone(), Duration::from_secs(3));
        assert!(mon.on_heartbeat(&hdr(7), &hb(MavType::MAV_TYPE_QUADROTOR, MavModeFlag::empty())));
        assert_eq!(link.status(), LinkStatus::Connected);
        assert_eq!(link.target(), Some((7, 1)));
        assert_eq!(mon.await_first_heartbeat(Duration::from_secs(1)).await, Ok((7, 1)));
        assert!(mon.is_alive());
        assert_eq!(mon.latest().unwrap().custom_mode, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_gcs_and_foreign_heartbeats() {
        let (link, _vehicle) = Link::loopback(1, 1);
        let mon = HeartbeatMonitor::new(link.clone(), Duration::from_secs(3));
        assert!(!mon.on_heartbeat(&hdr(255), &hb(MavType::MAV_TYPE_GCS, MavModeFlag::empty())));
        assert_eq!(link.status(), LinkStatus::Connecting);

        mon.on_heartbeat(&hdr(1), &hb(MavType::MAV_TYPE_QUADROTOR, MavModeFlag::empty()));
        assert!(!mon.on_heartbeat(&hdr(2), &hb(MavType::MAV_TYPE_QUADROTOR, MavModeFlag::empty())));
        assert_eq!(mon.latest().unwrap().system_id, 1);
        assert_eq!(mon.heartbeats_received(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn armed_flag_is_decoded() {
        let (link, _vehicle) = Link::loopback(1, 1);
        let mon = HeartbeatMonitor::new(link, Duration::from_secs(3));
        mon.on_heartbeat(&hdr(1), &hb(MavType::MAV_TYPE_QUADROTOR, MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED));
        assert!(mon.latest().unwrap().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_heartbeat_marks_link_lost() {
        let (link, _vehicle) = Link::loopback(1, 1);
        let mon = HeartbeatMonitor::new(link.clone(), Duration::from_secs(3));
        mon.on_heartbeat(&hdr(1), &hb(MavType::MAV_TYPE_QUADROTOR, MavModeFlag::empty()));

        tokio::time::advance(Duration::from_millis(2_900)).await;
        assert!(mon.check_liveness());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!mon.check_liveness());
        assert_eq!(link.status(), LinkStatus::Lost);
        assert!(!mon.is_alive());

        // Lost is sticky
        mon.on_heartbeat(&hdr(1), &hb(MavType::MAV_TYPE_QUADROTOR, MavModeFlag::empty()));
        assert_eq!(link.status(), LinkStatus::Lost);
    }

    #[tokio::test(start_paused = true)]
    async fn no_heartbeat_times_out() {
        let (link, _vehicle) = Link::loopback(1, 1);
        let mon = HeartbeatMonitor::new(link, Duration::from_secs(3));
        let start = Instant::now();
        let err = mon.await_first_heartbeat(Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(err, ConnectionError::NoHeartbeat { waited: Duration::from_secs(10) });
        assert!(start.elapsed() >= Duration::from_secs(10));
    }
}
