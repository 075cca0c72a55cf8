use std::sync::Arc;

use arc_swap::ArcSwapOption;
use mavlink::ardupilotmega::{
    MavFrame, MavMessage, PositionTargetTypemask, RC_CHANNELS_OVERRIDE_DATA,
    SET_POSITION_TARGET_LOCAL_NED_DATA,
};
use sortie_proto::{MotionSetpoint, SetpointSource};

use crate::link::Connection;

const IGNORE_POS: u16 = 0b111;
const IGNORE_VEL: u16 = 0b111 << 3;
const IGNORE_ACC: u16 = 0b111 << 6;
const FORCE: u16 = 1 << 9;
const IGNORE_YAW: u16 = 1 << 10;
const IGNORE_YAW_RATE: u16 = 1 << 11;

/// Only x/y/z are used.
pub const POSITION_MASK: u16 = IGNORE_VEL | IGNORE_ACC | FORCE | IGNORE_YAW | IGNORE_YAW_RATE;
/// vx/vy/vz and yaw rate are used.
pub const VELOCITY_MASK: u16 = IGNORE_POS | IGNORE_ACC | FORCE | IGNORE_YAW;

/// `SET_POSITION_TARGET_LOCAL_NED` type mask for a guided setpoint.
pub fn type_mask(sp: &MotionSetpoint) -> Option<u16> {
    match sp {
        MotionSetpoint::Velocity { .. } => Some(VELOCITY_MASK),
        MotionSetpoint::Position { .. } => Some(POSITION_MASK),
        MotionSetpoint::RawOverride { .. } => None,
    }
}

pub fn encode(sp: &MotionSetpoint, target: Connection, time_boot_ms: u32) -> MavMessage {
    let (mut x, mut y, mut z) = (0.0, 0.0, 0.0);
    let (mut vx, mut vy, mut vz, mut yaw_rate) = (0.0, 0.0, 0.0, 0.0);
    match *sp {
        MotionSetpoint::Velocity { vx: a, vy: b, vz: c, yaw_rate: r } => {
            (vx, vy, vz, yaw_rate) = (a, b, c, r);
        }
        MotionSetpoint::Position { north, east, down } => {
            (x, y, z) = (north, east, down);
        }
        MotionSetpoint::RawOverride { channels: c } => {
            return MavMessage::RC_CHANNELS_OVERRIDE(RC_CHANNELS_OVERRIDE_DATA {
                chan1_raw: c[0],
                chan2_raw: c[1],
                chan3_raw: c[2],
                chan4_raw: c[3],
                chan5_raw: c[4],
                chan6_raw: c[5],
                chan7_raw: c[6],
                chan8_raw: c[7],
                target_system: target.system_id,
                target_component: target.component_id,
                ..Default::default()
            });
        }
    }

    let mask = type_mask(sp).unwrap_or(POSITION_MASK);
    MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
        time_boot_ms,
        x,
        y,
        z,
        vx,
        vy,
        vz,
        afx: 0.0,
        afy: 0.0,
        afz: 0.0,
        yaw: 0.0,
        yaw_rate,
        type_mask: PositionTargetTypemask::from_bits_truncate(mask),
        target_system: target.system_id,
        target_component: target.component_id,
        coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
    })
}

/// The setpoint the streamer publishes.
///
/// A scripted setpoint (mission step, throttle ramp) wins over the live
/// source; with neither, the vehicle is told to hold.
pub struct SetpointBus {
    scripted: ArcSwapOption<MotionSetpoint>,
    live: Option<Arc<dyn SetpointSource>>,
}

impl SetpointBus {
    pub fn new(live: Option<Arc<dyn SetpointSource>>) -> Self {
        Self { scripted: ArcSwapOption::from(None), live }
    }

    pub fn script(&self, sp: MotionSetpoint) {
        self.scripted.store(Some(Arc::new(sp)));
    }

    /// Hand control back to the live source.
    pub fn release(&self) {
        self.scripted.store(None);
    }
}

impl SetpointSource for SetpointBus {
    fn current_setpoint(&self) -> MotionSetpoint {
        if let Some(sp) = self.scripted.load().as_deref() {
            return *sp;
        }
        match &self.live {
            Some(live) => live.current_setpoint(),
            None => MotionSetpoint::HOLD,
        }
    }
}
