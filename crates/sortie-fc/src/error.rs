use std::time::Duration;

use thiserror::Error;

use crate::command::CommandKind;

/// Failures of the link itself, independent of what was being sent.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("mavlink send failed: {0}")]
    Send(String),

    #[error("link closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum FcError {
    /// Peer never answered at startup, or went silent mid-flight.
    #[error("no heartbeat from vehicle within {0:?}")]
    NoHeartbeat(Duration),

    #[error("{kind} rejected by vehicle (result {code})")]
    CommandRejected { kind: CommandKind, code: u8 },

    #[error("{kind} not acknowledged after {attempts} attempts")]
    CommandTimedOut { kind: CommandKind, attempts: u32 },

    #[error("mode {name:?} unknown to vehicle (available: {available})")]
    ModeUnknown { name: String, available: String },

    #[error("no vehicle connection established yet")]
    NotConnected,

    #[error("{0} already awaiting acknowledgement")]
    CommandInFlight(CommandKind),

    #[error(transparent)]
    Link(#[from] LinkError),
}
