//! Scripted vehicle behind a loopback link.
//!
//! Acks commands unless told to stay silent, climbs and descends at a fixed
//! rate, streams position every 100 ms and heartbeats every second.
//! Everything the controller sends is kept for inspection.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavlink::common::{
    MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavResult, MavState, MavType, COMMAND_ACK_DATA,
    COMMAND_LONG_DATA, GLOBAL_POSITION_INT_DATA, HEARTBEAT_DATA,
};
use swarm_fc::link::{Link, VehicleEnd};
use swarm_fc::rc_override::packet_of;
use swarm_fc::{LinkConfig, Session};
use swarm_mission::{FlightController, MissionConfig};
use swarm_proto::rc::OverridePacket;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SimSettings {
    pub arm_result: MavResult,
    pub land_result: MavResult,
    /// Commands that are carried out but never acknowledged.
    pub silent: Vec<MavCmd>,
    /// Highest altitude the vehicle can reach, whatever TAKEOFF asked for.
    pub ceiling_m: f32,
    pub climb_rate_mps: f32,
    /// Stop heartbeating after this long.
    pub heartbeats_for: Option<Duration>,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            arm_result: MavResult::MAV_RESULT_ACCEPTED,
            land_result: MavResult::MAV_RESULT_ACCEPTED,
            silent: Vec::new(),
            ceiling_m: 100.0,
            climb_rate_mps: 1.0,
            heartbeats_for: None,
        }
    }
}

#[derive(Debug, Default)]
struct Vehicle {
    armed: bool,
    alt: f32,
    target: f32,
    custom_mode: u32,
}

impl Vehicle {
    fn apply(&mut self, cmd: &COMMAND_LONG_DATA, s: &SimSettings) -> MavResult {
        match cmd.command {
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM if cmd.param1 == 1.0 => {
                if s.arm_result == MavResult::MAV_RESULT_ACCEPTED {
                    self.armed = true;
                }
                s.arm_result
            }
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM => {
                self.armed = false;
                self.target = 0.0;
                MavResult::MAV_RESULT_ACCEPTED
            }
            MavCmd::MAV_CMD_NAV_TAKEOFF if self.armed => {
                self.target = cmd.param7;
                MavResult::MAV_RESULT_ACCEPTED
            }
            MavCmd::MAV_CMD_NAV_TAKEOFF => MavResult::MAV_RESULT_DENIED,
            MavCmd::MAV_CMD_NAV_LAND => {
                if s.land_result == MavResult::MAV_RESULT_ACCEPTED {
                    self.target = 0.0;
                }
                s.land_result
            }
            MavCmd::MAV_CMD_DO_SET_MODE => {
                self.custom_mode = cmd.param2 as u32;
                MavResult::MAV_RESULT_ACCEPTED
            }
            _ => MavResult::MAV_RESULT_UNSUPPORTED,
        }
    }

    fn step(&mut self, s: &SimSettings) {
        let goal = self.target.min(s.ceiling_m);
        let dz = s.climb_rate_mps * TICK.as_secs_f32();
        self.alt = if self.alt < goal { (self.alt + dz).min(goal) } else { (self.alt - dz).max(goal) };
    }

    fn heartbeat(&self) -> MavMessage {
        let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if self.armed {
            base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: self.custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode,
            system_status: if self.armed { MavState::MAV_STATE_ACTIVE } else { MavState::MAV_STATE_STANDBY },
            mavlink_version: 3,
        })
    }

    fn position(&self) -> MavMessage {
        let moving = if self.alt > 0.5 { 150 } else { 0 };
        MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            relative_alt: (self.alt * 1000.0) as i32,
            vx: moving,
            ..Default::default()
        })
    }
}

pub struct SimVehicle {
    log: Arc<Mutex<Vec<MavMessage>>>,
    task: JoinHandle<()>,
}

impl SimVehicle {
    pub fn spawn(end: VehicleEnd, settings: SimSettings) -> Self {
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(run(end, settings, log.clone()));
        Self { log, task }
    }

    /// Everything received from the controller so far.
    pub fn received(&self) -> Vec<MavMessage> {
        self.log.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<COMMAND_LONG_DATA> {
        self.received()
            .into_iter()
            .filter_map(|m| match m {
                MavMessage::COMMAND_LONG(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn command_ids(&self) -> Vec<MavCmd> {
        self.commands().iter().map(|c| c.command).collect()
    }

    pub fn overrides(&self) -> Vec<OverridePacket> {
        self.received().iter().filter_map(packet_of).collect()
    }
}

impl Drop for SimVehicle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(mut end: VehicleEnd, s: SimSettings, log: Arc<Mutex<Vec<MavMessage>>>) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(TICK);
    let mut vehicle = Vehicle::default();
    let mut n: u64 = 0;

    loop {
        ticker.tick().await;

        while let Some(msg) = end.try_recv() {
            if let MavMessage::COMMAND_LONG(cmd) = &msg {
                let result = vehicle.apply(cmd, &s);
                let ack = MavMessage::COMMAND_ACK(COMMAND_ACK_DATA { command: cmd.command, result, ..Default::default() });
                if !s.silent.contains(&cmd.command) && end.send(ack).is_err() {
                    return;
                }
            }
            log.lock().unwrap().push(msg);
        }

        vehicle.step(&s);

        let beating = s.heartbeats_for.map_or(true, |d| started.elapsed() < d);
        if n % 10 == 0 && beating && end.send(vehicle.heartbeat()).is_err() {
            return;
        }
        if end.send(vehicle.position()).is_err() {
            return;
        }
        n += 1;
    }
}

/// Short timings so a whole flight fits in a few virtual seconds.
pub fn quick_mission() -> MissionConfig {
    MissionConfig {
        cruise_duration_ms: Some(3_000),
        takeoff_timeout_ms: Some(10_000),
        land_timeout_ms: Some(10_000),
        release_settle_ms: Some(500),
        ..MissionConfig::default()
    }
}

pub async fn connect(settings: SimSettings) -> (Session, SimVehicle) {
    let (link, end) = Link::loopback(1, 1);
    let sim = SimVehicle::spawn(end, settings);
    let session = Session::attach(link, &LinkConfig::default()).await.expect("vehicle should connect");
    (session, sim)
}

pub async fn controller(settings: SimSettings, cfg: MissionConfig) -> (FlightController, SimVehicle) {
    let (session, sim) = connect(settings).await;
    (FlightController::new(session, cfg), sim)
}

/// Lets the vehicle pick up whatever the controller sent last.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}
