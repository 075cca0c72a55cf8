//! Keyboard-driven setpoint sources.
//!
//! Mixers turn key events into a [`MotionSetpoint`] that the streamer samples
//! on its own schedule. Key events and ticks never wait on each other; every
//! update swaps in a whole new state.

pub mod rc;
pub mod velocity;

use sortie_proto::SetpointSource;

pub use rc::{RcConfig, RcMixer};
pub use velocity::{VelocityConfig, VelocityMixer};

/// Terminal-independent key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Char(char),
    Up,
    Down,
    Left,
    Right,
    Space,
    Esc,
}

impl Key {
    /// Letters compare case-insensitively.
    pub fn normalized(self) -> Key {
        match self {
            Key::Char(c) => Key::Char(c.to_ascii_lowercase()),
            other => other,
        }
    }
}

/// A setpoint source fed by key events.
pub trait InputMixer: SetpointSource {
    fn press(&self, key: Key);

    /// Terminals without release events never call this.
    fn release(&self, _key: Key) {}

    /// One line describing the current output, for the status display.
    fn describe(&self) -> String {
        format!("{:?}", self.current_setpoint())
    }
}
