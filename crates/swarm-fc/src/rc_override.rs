use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mavlink::common::{MavMessage, RC_CHANNELS_OVERRIDE_DATA};
use swarm_proto::rc::OverridePacket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::LinkLost;
use crate::link::Link;

pub fn override_message(packet: &OverridePacket, target: (u8, u8)) -> MavMessage {
    MavMessage::RC_CHANNELS_OVERRIDE(RC_CHANNELS_OVERRIDE_DATA {
        target_system: target.0,
        target_component: target.1,
        chan1_raw: packet.roll,
        chan2_raw: packet.pitch,
        chan3_raw: packet.throttle,
        chan4_raw: packet.yaw,
        chan5_raw: 0,
        chan6_raw: 0,
        chan7_raw: 0,
        chan8_raw: 0,
        ..Default::default()
    })
}

/// Axes carried by an RC_CHANNELS_OVERRIDE, if `msg` is one.
pub fn packet_of(msg: &MavMessage) -> Option<OverridePacket> {
    match msg {
        MavMessage::RC_CHANNELS_OVERRIDE(o) => Some(OverridePacket {
            roll: o.chan1_raw,
            pitch: o.chan2_raw,
            throttle: o.chan3_raw,
            yaw: o.chan4_raw,
        }),
        _ => None,
    }
}

/// Streams the current stick packet to the vehicle at a fixed cadence.
///
/// The vehicle drops an override it stops hearing, so the packet is resent
/// every tick whether or not it changed. The first tick goes out right away
/// carrying `initial`.
pub struct OverrideChannel {
    link: Arc<Link>,
    packet: Arc<Mutex<OverridePacket>>,
    sent: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    cadence: Duration,
}

impl OverrideChannel {
    pub fn begin(link: Arc<Link>, cadence: Duration, initial: OverridePacket) -> Self {
        let initial = OverridePacket::new(initial.roll, initial.pitch, initial.throttle, initial.yaw);
        let packet = Arc::new(Mutex::new(initial));
        let sent = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(transmit_loop(
            link.clone(),
            packet.clone(),
            sent.clone(),
            stop.clone(),
            cadence,
        ));
        info!("override: started, cadence {:?}", cadence);

        Self { link, packet, sent, stop, task: Some(task), cadence }
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some() && !self.stop.load(Ordering::Acquire)
    }

    /// Stores the axes for the next transmissions; returns them after clamping.
    pub fn set_axes(&self, roll: u16, pitch: u16, throttle: u16, yaw: u16) -> OverridePacket {
        self.set_packet(OverridePacket::new(roll, pitch, throttle, yaw))
    }

    pub fn set_packet(&self, packet: OverridePacket) -> OverridePacket {
        let clamped = OverridePacket::new(packet.roll, packet.pitch, packet.throttle, packet.yaw);
        *self.lock() = clamped;
        clamped
    }

    pub fn packet(&self) -> OverridePacket {
        *self.lock()
    }

    pub fn packets_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Holds `packet` on the sticks for `duration`.
    pub async fn hold(&self, packet: OverridePacket, duration: Duration) {
        self.set_packet(packet);
        tokio::time::sleep(duration).await;
    }

    /// Sends one all-zero packet now and keeps the axes released.
    pub fn release(&self) -> Result<(), LinkLost> {
        *self.lock() = OverridePacket::RELEASE;
        let target = self.link.target().unwrap_or((0, 0));
        self.link.send(override_message(&OverridePacket::RELEASE, target))?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        debug!("override: released");
        Ok(())
    }

    /// Stops transmitting. Does not release; call `release()` first for a soft
    /// hand-back.
    pub async fn end(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            let _ = task.await;
            info!("override: stopped after {} packets", self.packets_sent());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OverridePacket> {
        self.packet.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for OverrideChannel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn transmit_loop(
    link: Arc<Link>,
    packet: Arc<Mutex<OverridePacket>>,
    sent: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    cadence: Duration,
) {
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if stop.load(Ordering::Acquire) {
            break;
        }
        let current = *packet.lock().unwrap_or_else(PoisonError::into_inner);
        let target = link.target().unwrap_or((0, 0));
        if link.send(override_message(&current, target)).is_err() {
            warn!("override: link gone, transmitter exiting");
            break;
        }
        sent.fetch_add(1, Ordering::Relaxed);
    }
}
