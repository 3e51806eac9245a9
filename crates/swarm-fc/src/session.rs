use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mavlink::common::{MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};
use mavlink::Message;
use swarm_proto::rc::OverridePacket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::ConnectionError;
use crate::heartbeat::HeartbeatMonitor;
use crate::link::{Endpoint, Link, LinkStatus};
use crate::rc_override::OverrideChannel;
use crate::telemetry::TelemetryReader;
use crate::LinkConfig;

const RECV_POLL: Duration = Duration::from_millis(100);

/// One connection to one vehicle, with its background receive loop.
///
/// The caller owns it and ends it with `shutdown()`.
pub struct Session {
    link: Arc<Link>,
    monitor: Arc<HeartbeatMonitor>,
    telemetry: Arc<TelemetryReader>,
    dispatcher: Dispatcher,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    target: (u8, u8),
}

impl Session {
    /// Connects to `cfg.endpoint` and waits for the vehicle heartbeat.
    pub async fn start(cfg: &LinkConfig) -> Result<Self, ConnectionError> {
        let endpoint: Endpoint = cfg
            .endpoint
            .parse()
            .map_err(|e: anyhow::Error| ConnectionError::unreachable(format!("{:#}", e)))?;
        let link = Link::connect(&endpoint, cfg.sys_id(), cfg.comp_id(), cfg.connect_timeout()).await?;
        Self::attach(link, cfg).await
    }

    /// Runs a session over an already-open link.
    pub async fn attach(link: Arc<Link>, cfg: &LinkConfig) -> Result<Self, ConnectionError> {
        let monitor = Arc::new(HeartbeatMonitor::new(link.clone(), cfg.liveness_window()));
        let telemetry = Arc::new(TelemetryReader::new());
        let dispatcher = Dispatcher::new(link.clone(), cfg.ack_window(), cfg.command_retries());
        let stop = Arc::new(AtomicBool::new(false));

        let receiver = tokio::spawn(receive_loop(
            link.clone(),
            monitor.clone(),
            telemetry.clone(),
            dispatcher.clone(),
            stop.clone(),
            cfg.send_heartbeat_interval(),
        ));

        let mut session = Self {
            link,
            monitor,
            telemetry,
            dispatcher,
            stop,
            receiver: Some(receiver),
            target: (0, 0),
        };

        let first = session.monitor.await_first_heartbeat(cfg.heartbeat_timeout()).await;
        match first {
            Ok(target) => {
                session.target = target;
                info!("session: connected to {} (sys={}, comp={})", session.link.label(), target.0, target.1);
                Ok(session)
            }
            Err(e) => {
                warn!("session: {}", e);
                session.shutdown().await;
                Err(e)
            }
        }
    }

    pub fn target(&self) -> (u8, u8) {
        self.target
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn status(&self) -> LinkStatus {
        self.link.status()
    }

    pub fn is_alive(&self) -> bool {
        self.monitor.is_alive()
    }

    pub fn monitor(&self) -> &HeartbeatMonitor {
        &self.monitor
    }

    pub fn telemetry(&self) -> &TelemetryReader {
        &self.telemetry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn begin_override(&self, cadence: Duration, initial: OverridePacket) -> OverrideChannel {
        OverrideChannel::begin(self.link.clone(), cadence, initial)
    }

    /// Stops the receive loop and closes the link.
    pub async fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(task) = self.receiver.take() {
            let _ = task.await;
        }
        self.dispatcher.fail_all();
        self.link.close();
        info!("session: closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
    }
}

fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

async fn receive_loop(
    link: Arc<Link>,
    monitor: Arc<HeartbeatMonitor>,
    telemetry: Arc<TelemetryReader>,
    dispatcher: Dispatcher,
    stop: Arc<AtomicBool>,
    hb_interval: Duration,
) {
    let mut next_hb = Instant::now();

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        // Send companion heartbeat periodically
        if Instant::now() >= next_hb {
            let _ = link.send(gcs_heartbeat());
            next_hb = Instant::now() + hb_interval;
        }

        match link.recv(RECV_POLL).await {
            Ok(Some((hdr, msg))) => match &msg {
                MavMessage::HEARTBEAT(hb) => {
                    monitor.on_heartbeat(&hdr, hb);
                }
                MavMessage::COMMAND_ACK(ack) => dispatcher.on_ack(ack),
                other => {
                    if !telemetry.ingest(other) {
                        debug!("session: ignoring message id {}", other.message_id());
                    }
                }
            },
            Ok(None) => {}
            Err(_) => {
                warn!("session: transport closed");
                dispatcher.fail_all();
                break;
            }
        }

        if !monitor.check_liveness() && link.status() == LinkStatus::Lost {
            dispatcher.fail_all();
            break;
        }
    }
    debug!("session: receive loop stopped");
}
