use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Deserialize;
use sortie_proto::{MotionSetpoint, SetpointSource};
use tracing::debug;

use crate::{InputMixer, Key};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VelocityConfig {
    /// Horizontal speed while W/A/S/D is held, m/s.
    pub max_speed: f32,
    /// Vertical speed while I/K is held, m/s.
    pub climb_rate: f32,
    /// Yaw rate while Q/E is held, rad/s.
    pub yaw_rate: f32,
    /// How long a press counts as held when no release event arrives.
    /// Terminal autorepeat keeps refreshing it.
    pub key_hold_ms: u64,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self { max_speed: 2.0, climb_rate: 1.0, yaw_rate: 0.5, key_hold_ms: 600 }
    }
}

/// Held keys become body velocities in local NED.
///
/// W/S forward/back, A/D left/right, I/K climb/descend, Q/E yaw. Opposite
/// keys cancel. Space drops everything.
pub struct VelocityMixer {
    cfg: VelocityConfig,
    held: ArcSwap<BTreeMap<Key, Instant>>,
}

impl VelocityMixer {
    pub fn new(cfg: VelocityConfig) -> Self {
        Self { cfg, held: ArcSwap::from_pointee(BTreeMap::new()) }
    }

    pub fn press_at(&self, key: Key, at: Instant) {
        let key = key.normalized();
        if key == Key::Space {
            self.held.store(Default::default());
            debug!("velocity: stop");
            return;
        }
        self.held.rcu(|held| {
            let mut next = BTreeMap::clone(held);
            next.insert(key, at);
            next
        });
    }

    pub fn setpoint_at(&self, now: Instant) -> MotionSetpoint {
        let held = self.held.load();
        let hold = Duration::from_millis(self.cfg.key_hold_ms);
        let on = |c: char| -> f32 {
            match held.get(&Key::Char(c)) {
                Some(t) if now.saturating_duration_since(*t) < hold => 1.0,
                _ => 0.0,
            }
        };
        MotionSetpoint::Velocity {
            vx: (on('w') - on('s')) * self.cfg.max_speed,
            vy: (on('d') - on('a')) * self.cfg.max_speed,
            // down is positive
            vz: (on('k') - on('i')) * self.cfg.climb_rate,
            yaw_rate: (on('e') - on('q')) * self.cfg.yaw_rate,
        }
    }
}

impl SetpointSource for VelocityMixer {
    fn current_setpoint(&self) -> MotionSetpoint {
        self.setpoint_at(Instant::now())
    }
}

impl InputMixer for VelocityMixer {
    fn press(&self, key: Key) {
        self.press_at(key, Instant::now());
    }

    fn release(&self, key: Key) {
        let key = key.normalized();
        self.held.rcu(|held| {
            let mut next = BTreeMap::clone(held);
            next.remove(&key);
            next
        });
    }

    fn describe(&self) -> String {
        match self.current_setpoint() {
            MotionSetpoint::Velocity { vx, vy, vz, yaw_rate } => {
                format!("vx {:+.1} vy {:+.1} vz {:+.1} yaw {:+.2}", vx, vy, vz, yaw_rate)
            }
            other => format!("{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn velocity(sp: MotionSetpoint) -> (f32, f32, f32, f32) {
        match sp {
            MotionSetpoint::Velocity { vx, vy, vz, yaw_rate } => (vx, vy, vz, yaw_rate),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn held_keys_mix() {
        let m = VelocityMixer::new(VelocityConfig::default());
        let t0 = Instant::now();
        m.press_at(Key::Char('W'), t0);
        m.press_at(Key::Char('d'), t0);
        m.press_at(Key::Char('i'), t0);
        assert_eq!(velocity(m.setpoint_at(t0)), (2.0, 2.0, -1.0, 0.0));

        m.release(Key::Char('d'));
        assert_eq!(velocity(m.setpoint_at(t0)), (2.0, 0.0, -1.0, 0.0));

        m.press_at(Key::Char('s'), t0);
        assert_eq!(velocity(m.setpoint_at(t0)).0, 0.0);
    }

    #[test]
    fn press_expires_without_release() {
        let m = VelocityMixer::new(VelocityConfig { key_hold_ms: 300, ..VelocityConfig::default() });
        let t0 = Instant::now();
        m.press_at(Key::Char('e'), t0);
        assert_eq!(velocity(m.setpoint_at(t0 + Duration::from_millis(200))).3, 0.5);
        assert_eq!(m.setpoint_at(t0 + Duration::from_millis(400)), MotionSetpoint::HOLD);

        // autorepeat refreshes the hold
        m.press_at(Key::Char('e'), t0 + Duration::from_millis(350));
        assert_eq!(velocity(m.setpoint_at(t0 + Duration::from_millis(500))).3, 0.5);
    }

    #[test]
    fn space_stops() {
        let m = VelocityMixer::new(VelocityConfig::default());
        let t0 = Instant::now();
        m.press_at(Key::Char('w'), t0);
        m.press_at(Key::Char('q'), t0);
        m.press_at(Key::Space, t0);
        assert_eq!(m.setpoint_at(t0), MotionSetpoint::HOLD);
    }

    #[test]
    fn config_from_toml() {
        let cfg: VelocityConfig = toml::from_str("max_speed = 3.5").unwrap();
        assert_eq!(cfg.max_speed, 3.5);
        assert_eq!(cfg.climb_rate, 1.0);
    }
}
