use arc_swap::ArcSwap;
use serde::Deserialize;
use sortie_proto::setpoint::{RC_MAX, RC_MIN, RC_NEUTRAL};
use sortie_proto::{MotionSetpoint, SetpointSource};
use tracing::debug;

use crate::{InputMixer, Key};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RcConfig {
    /// PWM change per key press, µs.
    pub step: u16,
    /// Throttle when the mixer takes over.
    pub initial_throttle: u16,
}

impl Default for RcConfig {
    fn default() -> Self {
        Self { step: 50, initial_throttle: RC_NEUTRAL }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sticks {
    roll: u16,
    pitch: u16,
    throttle: u16,
    yaw: u16,
}

/// Each press nudges one stick. W/S pitch forward/back, A/D roll, Q/E yaw,
/// Up/Down throttle; Space centers everything but throttle.
pub struct RcMixer {
    step: u16,
    sticks: ArcSwap<Sticks>,
}

impl RcMixer {
    pub fn new(cfg: RcConfig) -> Self {
        let sticks = Sticks {
            roll: RC_NEUTRAL,
            pitch: RC_NEUTRAL,
            throttle: cfg.initial_throttle.clamp(RC_MIN, RC_MAX),
            yaw: RC_NEUTRAL,
        };
        Self { step: cfg.step, sticks: ArcSwap::from_pointee(sticks) }
    }
}

fn nudge(v: u16, delta: i32) -> u16 {
    let moved = (i32::from(v) + delta).clamp(i32::from(RC_MIN), i32::from(RC_MAX));
    u16::try_from(moved).unwrap_or(RC_NEUTRAL)
}

impl SetpointSource for RcMixer {
    fn current_setpoint(&self) -> MotionSetpoint {
        let s = **self.sticks.load();
        MotionSetpoint::sticks(s.roll, s.pitch, s.throttle, s.yaw)
    }
}

impl InputMixer for RcMixer {
    fn press(&self, key: Key) {
        let step = i32::from(self.step);
        let key = key.normalized();
        self.sticks.rcu(|s| {
            let mut s = **s;
            match key {
                Key::Char('w') => s.pitch = nudge(s.pitch, -step),
                Key::Char('s') => s.pitch = nudge(s.pitch, step),
                Key::Char('a') => s.roll = nudge(s.roll, -step),
                Key::Char('d') => s.roll = nudge(s.roll, step),
                Key::Char('q') => s.yaw = nudge(s.yaw, -step),
                Key::Char('e') => s.yaw = nudge(s.yaw, step),
                Key::Up => s.throttle = nudge(s.throttle, step),
                Key::Down => s.throttle = nudge(s.throttle, -step),
                Key::Space => {
                    s.roll = RC_NEUTRAL;
                    s.pitch = RC_NEUTRAL;
                    s.yaw = RC_NEUTRAL;
                }
                _ => {}
            }
            s
        });
        debug!("rc: {:?} after {:?}", **self.sticks.load(), key);
    }

    fn describe(&self) -> String {
        let s = **self.sticks.load();
        format!("roll {} pitch {} throttle {} yaw {}", s.roll, s.pitch, s.throttle, s.yaw)
    }
}
