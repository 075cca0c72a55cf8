//! Types shared between the flight controller, the input mixers and the CLI.

pub mod event;
pub mod flight;
pub mod setpoint;

pub use event::FlightEvent;
pub use flight::{AbortReason, FlightPhase};
pub use setpoint::{MotionSetpoint, SetpointSource};
