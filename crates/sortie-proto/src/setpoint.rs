use serde::{Deserialize, Serialize};

/// PWM value for a centered stick.
pub const RC_NEUTRAL: u16 = 1500;
pub const RC_MIN: u16 = 1000;
pub const RC_MAX: u16 = 2000;

/// The motion currently commanded to the vehicle.
///
/// Velocities are m/s and positions metres in the local NED frame (down is
/// positive, so climbing means a negative `vz`). RC channels are pulse widths
/// in microseconds; 0 hands a channel back to the radio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MotionSetpoint {
    Velocity { vx: f32, vy: f32, vz: f32, yaw_rate: f32 },
    Position { north: f32, east: f32, down: f32 },
    RawOverride { channels: [u16; 8] },
}

impl MotionSetpoint {
    /// Zero velocity: stop and hold.
    pub const HOLD: MotionSetpoint = MotionSetpoint::Velocity { vx: 0.0, vy: 0.0, vz: 0.0, yaw_rate: 0.0 };

    /// Roll, pitch and yaw centered, throttle as given, aux channels released.
    pub fn sticks(roll: u16, pitch: u16, throttle: u16, yaw: u16) -> Self {
        MotionSetpoint::RawOverride { channels: [roll, pitch, throttle, yaw, 0, 0, 0, 0] }
    }

    pub fn throttle_only(throttle: u16) -> Self {
        Self::sticks(RC_NEUTRAL, RC_NEUTRAL, throttle, RC_NEUTRAL)
    }

    /// Throttle channel of an RC override, `None` for guided setpoints.
    pub fn throttle(&self) -> Option<u16> {
        match self {
            MotionSetpoint::RawOverride { channels } => Some(channels[2]),
            _ => None,
        }
    }
}

/// Anything the setpoint streamer can sample on its tick.
///
/// Implementations must not block and must return a value that was stored
/// as a whole, never one assembled from two different updates.
pub trait SetpointSource: Send + Sync {
    fn current_setpoint(&self) -> MotionSetpoint;
}
