use std::fmt;
use std::io::ErrorKind;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use mavlink::{common::MavMessage, error::MessageReadError, MavConnection, MavHeader};
use tokio::sync::{mpsc, watch};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, LinkLost};

pub type Frame = (MavHeader, MavMessage);

type SharedConn = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Udp { host: String, port: u16 },
    Serial { dev: String, baud: u32 },
}

impl Endpoint {
    /// Connection string understood by `mavlink::connect`.
    pub fn mavlink_url(&self) -> String {
        match self {
            Endpoint::Tcp { host, port } => format!("tcpout:{}:{}", host, port),
            Endpoint::Udp { host, port } => format!("udpin:{}:{}", host, port),
            Endpoint::Serial { dev, baud } => format!("serial:{}:{}", dev, baud),
        }
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (kind, rest) = s.split_once(':').context("endpoint needs a transport prefix (tcp:, udp:, serial:)")?;
        let (addr, tail) = rest.rsplit_once(':').with_context(|| format!("endpoint {} missing port/baud", s))?;
        anyhow::ensure!(!addr.is_empty(), "endpoint {} missing host/device", s);
        match kind {
            "tcp" => Ok(Endpoint::Tcp {
                host: addr.to_string(),
                port: tail.parse().with_context(|| format!("bad tcp port in {}", s))?,
            }),
            "udp" => Ok(Endpoint::Udp {
                host: addr.to_string(),
                port: tail.parse().with_context(|| format!("bad udp port in {}", s))?,
            }),
            "serial" => Ok(Endpoint::Serial {
                dev: addr.to_string(),
                baud: tail.parse().with_context(|| format!("bad baud rate in {}", s))?,
            }),
            other => anyhow::bail!("unknown transport: {}", other),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            Endpoint::Udp { host, port } => write!(f, "udp:{}:{}", host, port),
            Endpoint::Serial { dev, baud } => write!(f, "serial:{}:{}", dev, baud),
        }
    }
}

/// Message channel to one vehicle endpoint.
///
/// The transport itself (socket or serial port) lives on two I/O threads; this
/// handle only sees whole MAVLink messages. Shared as `Arc<Link>` for the
/// lifetime of a session.
pub struct Link {
    label: String,
    outbound: mpsc::UnboundedSender<MavMessage>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    status: watch::Sender<LinkStatus>,
    target: Mutex<Option<(u8, u8)>>,
}

impl Link {
    fn new(label: String) -> (Self, mpsc::UnboundedReceiver<MavMessage>, mpsc::UnboundedSender<Frame>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(LinkStatus::Disconnected);
        let link = Self {
            label,
            outbound: out_tx,
            inbound: tokio::sync::Mutex::new(in_rx),
            status,
            target: Mutex::new(None),
        };
        (link, out_rx, in_tx)
    }

    /// Opens the transport. The link is `Connecting` until the heartbeat
    /// monitor sees the vehicle.
    pub async fn connect(
        endpoint: &Endpoint,
        sys_id: u8,
        comp_id: u8,
        timeout: Duration,
    ) -> Result<Arc<Self>, ConnectionError> {
        info!("link: connecting to {}", endpoint);

        if let Endpoint::Serial { dev, baud } = endpoint {
            // quick validate device
            let _ = tokio_serial::new(dev, *baud)
                .open_native_async()
                .map_err(|e| ConnectionError::unreachable(format!("open serial device {}: {}", dev, e)))?;
        }

        let url = endpoint.mavlink_url();
        let url2 = url.clone();
        let opened = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || mavlink::connect::<MavMessage>(&url2)),
        )
        .await;

        let conn = match opened {
            Err(_) => return Err(ConnectionError::unreachable("no endpoint response")),
            Ok(Err(e)) => return Err(ConnectionError::unreachable(format!("connect task failed: {}", e))),
            Ok(Ok(Err(e))) => return Err(ConnectionError::unreachable(format!("mavlink connect {}: {}", url, e))),
            Ok(Ok(Ok(conn))) => conn,
        };
        let conn: SharedConn = Arc::from(conn);

        let (link, out_rx, in_tx) = Link::new(endpoint.to_string());
        let hdr = MavHeader { system_id: sys_id, component_id: comp_id, sequence: 0 };

        let rx_conn = conn.clone();
        std::thread::Builder::new()
            .name("mav-rx".into())
            .spawn(move || read_loop(rx_conn, in_tx))
            .map_err(|e| ConnectionError::unreachable(format!("spawn reader: {}", e)))?;
        std::thread::Builder::new()
            .name("mav-tx".into())
            .spawn(move || write_loop(conn, out_rx, hdr))
            .map_err(|e| ConnectionError::unreachable(format!("spawn writer: {}", e)))?;

        link.set_status(LinkStatus::Connecting);
        info!("link: transport up ({}), waiting for vehicle", url);
        Ok(Arc::new(link))
    }

    /// In-process link with the vehicle side handed back to the caller.
    /// Used to put a scripted endpoint behind a session.
    pub fn loopback(vehicle_sys: u8, vehicle_comp: u8) -> (Arc<Self>, VehicleEnd) {
        let (link, out_rx, in_tx) = Link::new("loopback".into());
        link.set_status(LinkStatus::Connecting);
        let end = VehicleEnd {
            tx: in_tx,
            rx: out_rx,
            hdr: MavHeader { system_id: vehicle_sys, component_id: vehicle_comp, sequence: 0 },
        };
        (Arc::new(link), end)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn send(&self, msg: MavMessage) -> Result<(), LinkLost> {
        self.outbound.send(msg).map_err(|_| {
            self.mark_lost();
            LinkLost
        })
    }

    /// `Ok(None)` on timeout, `Err(LinkLost)` once the transport is gone.
    pub async fn recv(&self, timeout: Duration) -> Result<Option<Frame>, LinkLost> {
        let mut rx = self.inbound.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                self.mark_lost();
                Err(LinkLost)
            }
            Err(_) => Ok(None),
        }
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    pub(crate) fn set_status(&self, status: LinkStatus) {
        let prev = self.status.send_replace(status);
        if prev != status {
            debug!("link {}: {:?} -> {:?}", self.label, prev, status);
        }
    }

    pub(crate) fn mark_lost(&self) {
        self.status.send_if_modified(|s| {
            if matches!(*s, LinkStatus::Connecting | LinkStatus::Connected) {
                *s = LinkStatus::Lost;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn close(&self) {
        self.set_status(LinkStatus::Disconnected);
    }

    /// Vehicle (system, component), known after the first heartbeat.
    pub fn target(&self) -> Option<(u8, u8)> {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_target(&self, sys: u8, comp: u8) {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = Some((sys, comp));
    }
}

fn read_loop(conn: SharedConn, in_tx: mpsc::UnboundedSender<Frame>) {
    loop {
        if in_tx.is_closed() {
            break;
        }
        match conn.recv() {
            Ok(frame) => {
                if in_tx.send(frame).is_err() {
                    break;
                }
            }
            Err(MessageReadError::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) =>
            {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(MessageReadError::Io(e)) => {
                warn!("link: receive failed: {}", e);
                break;
            }
            Err(e) => debug!("link: dropping undecodable frame: {:?}", e),
        }
    }
    debug!("link: reader stopped");
}

fn write_loop(conn: SharedConn, mut out_rx: mpsc::UnboundedReceiver<MavMessage>, mut hdr: MavHeader) {
    while let Some(msg) = out_rx.blocking_recv() {
        if let Err(e) = conn.send(&hdr, &msg) {
            warn!("link: send failed: {:?}", e);
            break;
        }
        hdr.sequence = hdr.sequence.wrapping_add(1);
    }
    debug!("link: writer stopped");
}

/// Vehicle side of a loopback link.
pub struct VehicleEnd {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<MavMessage>,
    hdr: MavHeader,
}

impl VehicleEnd {
    pub fn send(&mut self, msg: MavMessage) -> Result<(), LinkLost> {
        let hdr = self.hdr;
        self.hdr.sequence = self.hdr.sequence.wrapping_add(1);
        self.tx.send((hdr, msg)).map_err(|_| LinkLost)
    }

    /// Sends with an explicit header, e.g. to impersonate another system.
    pub fn send_as(&self, hdr: MavHeader, msg: MavMessage) -> Result<(), LinkLost> {
        self.tx.send((hdr, msg)).map_err(|_| LinkLost)
    }

    pub async fn recv(&mut self) -> Option<MavMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<MavMessage> {
        self.rx.try_recv().ok()
    }

    /// Everything the controller has sent so far.
    pub fn drain(&mut self) -> Vec<MavMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Splits into an independent sender (for a telemetry task) and this end.
    pub fn sender(&self) -> VehicleSender {
        VehicleSender { tx: self.tx.clone(), hdr: self.hdr }
    }
}

#[derive(Clone)]
pub struct VehicleSender {
    tx: mpsc::UnboundedSender<Frame>,
    hdr: MavHeader,
}

impl VehicleSender {
    pub fn send(&mut self, msg: MavMessage) -> Result<(), LinkLost> {
        let hdr = self.hdr;
        self.hdr.sequence = self.hdr.sequence.wrapping_add(1);
        self.tx.send((hdr, msg)).map_err(|_| LinkLost)
    }
}
