//! A scripted ArduCopter on the far end of a loopback link.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavlink::ardupilotmega::{
    MavCmd, MavMessage, MavResult, COMMAND_INT_DATA, COMMAND_LONG_DATA, GLOBAL_POSITION_INT_DATA,
};
use sortie_fc::loopback::{command_ack, vehicle_heartbeat, Peer};
use sortie_fc::{FcConfig, Link};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const STABILIZE: u32 = 0;
pub const GUIDED: u32 = 4;
pub const RTL: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    Ack(MavResult),
    Silent,
}

const ACCEPT: Reply = Reply::Ack(MavResult::MAV_RESULT_ACCEPTED);

#[derive(Debug, Clone)]
pub struct Policy {
    pub arm: Reply,
    pub disarm: Reply,
    pub set_mode: Reply,
    pub takeoff: Reply,
    pub land: Reply,
    pub rtl: Reply,
    /// Apply `DO_SET_MODE` sent as `COMMAND_INT`.
    pub honor_command_int: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            arm: ACCEPT,
            disarm: ACCEPT,
            set_mode: ACCEPT,
            takeoff: ACCEPT,
            land: ACCEPT,
            rtl: ACCEPT,
            honor_command_int: true,
        }
    }
}

impl Policy {
    fn reply(&self, c: &COMMAND_LONG_DATA) -> Reply {
        match c.command {
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM if c.param1 >= 0.5 => self.arm,
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM => self.disarm,
            MavCmd::MAV_CMD_DO_SET_MODE => self.set_mode,
            MavCmd::MAV_CMD_NAV_TAKEOFF => self.takeoff,
            MavCmd::MAV_CMD_NAV_LAND => self.land,
            MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH => self.rtl,
            _ => Reply::Ack(MavResult::MAV_RESULT_UNSUPPORTED),
        }
    }
}

#[derive(Debug, Default)]
struct Vehicle {
    mode: u32,
    armed: bool,
    alt_mm: i32,
}

impl Vehicle {
    fn apply(&mut self, command: MavCmd, params: [f32; 7]) {
        match command {
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM => {
                self.armed = params[0] >= 0.5;
                if !self.armed {
                    self.alt_mm = 0;
                }
            }
            MavCmd::MAV_CMD_DO_SET_MODE => self.mode = params[1] as u32,
            MavCmd::MAV_CMD_NAV_TAKEOFF => self.alt_mm = (params[6] * 1000.0) as i32,
            MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH => self.mode = RTL,
            MavCmd::MAV_CMD_NAV_LAND => self.mode = 9,
            _ => {}
        }
    }

    fn report(&self, peer: &Peer) {
        peer.inject(vehicle_heartbeat(self.mode, self.armed));
        if self.alt_mm > 0 {
            peer.inject(MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
                relative_alt: self.alt_mm,
                ..Default::default()
            }));
        }
    }
}

pub struct Sim {
    trace: Arc<Mutex<Vec<(Instant, MavMessage)>>>,
    mute: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Sim {
    pub fn start(mut peer: Peer, policy: Policy) -> Self {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mute = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn({
            let trace = trace.clone();
            let mute = mute.clone();
            async move {
                let mut vehicle = Vehicle::default();
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if !mute.load(Ordering::Relaxed) {
                                vehicle.report(&peer);
                            }
                        }
                        msg = peer.next_sent() => {
                            let Some(msg) = msg else { break };
                            trace.lock().unwrap().push((Instant::now(), msg.clone()));
                            match msg {
                                MavMessage::COMMAND_LONG(c) => {
                                    if let Reply::Ack(result) = policy.reply(&c) {
                                        peer.inject(command_ack(c.command, result));
                                        if result == MavResult::MAV_RESULT_ACCEPTED {
                                            let p = [c.param1, c.param2, c.param3, c.param4, c.param5, c.param6, c.param7];
                                            vehicle.apply(c.command, p);
                                            vehicle.report(&peer);
                                        }
                                    }
                                }
                                MavMessage::COMMAND_INT(c) => {
                                    if policy.honor_command_int && c.command == MavCmd::MAV_CMD_DO_SET_MODE {
                                        vehicle.apply(c.command, [c.param1, c.param2, c.param3, c.param4, 0.0, 0.0, 0.0]);
                                        vehicle.report(&peer);
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
        });
        Self { trace, mute, task }
    }

    /// Stop sending heartbeats; commands are still answered.
    pub fn mute(&self) {
        self.mute.store(true, Ordering::Relaxed);
    }

    pub fn trace(&self) -> Vec<(Instant, MavMessage)> {
        self.trace.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<COMMAND_LONG_DATA> {
        self.trace()
            .into_iter()
            .filter_map(|(_, m)| match m {
                MavMessage::COMMAND_LONG(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn command_ints(&self) -> Vec<COMMAND_INT_DATA> {
        self.trace()
            .into_iter()
            .filter_map(|(_, m)| match m {
                MavMessage::COMMAND_INT(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, cmd: MavCmd) -> usize {
        self.commands().iter().filter(|c| c.command == cmd).count()
    }

    /// Send times of every setpoint, guided or RC.
    pub fn setpoint_times(&self) -> Vec<Instant> {
        self.trace()
            .into_iter()
            .filter(|(_, m)| {
                matches!(m, MavMessage::SET_POSITION_TARGET_LOCAL_NED(_) | MavMessage::RC_CHANNELS_OVERRIDE(_))
            })
            .map(|(t, _)| t)
            .collect()
    }

    pub fn throttles(&self) -> Vec<u16> {
        self.trace()
            .into_iter()
            .filter_map(|(_, m)| match m {
                MavMessage::RC_CHANNELS_OVERRIDE(rc) => Some(rc.chan3_raw),
                _ => None,
            })
            .collect()
    }

    /// Index into the trace of the first command matching `pred`.
    pub fn position(&self, pred: impl Fn(&COMMAND_LONG_DATA) -> bool) -> Option<usize> {
        self.trace().iter().position(|(_, m)| matches!(m, MavMessage::COMMAND_LONG(c) if pred(c)))
    }
}

impl Drop for Sim {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Short waits so paused-clock tests stay readable.
pub fn test_config() -> FcConfig {
    let mut cfg = FcConfig::default();
    cfg.timing.first_heartbeat_timeout_ms = 5000;
    cfg.timing.ack_timeout_ms = 1000;
    cfg.timing.max_command_retries = 2;
    cfg.timing.takeoff_settle_ms = 5000;
    cfg.timing.landing_settle_ms = 3000;
    cfg.timing.mode_confirm_ms = 1000;
    cfg.timing.link_loss_ms = 3000;
    cfg
}

pub fn sim(policy: Policy) -> (Arc<Link>, Sim) {
    let (link, peer) = Link::loopback(255, 190);
    (link, Sim::start(peer, policy))
}
