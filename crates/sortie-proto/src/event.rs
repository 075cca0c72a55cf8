use serde::{Deserialize, Serialize};

/// One line of the flight journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightEvent {
    pub ts_unix_ms: i64,
    /// Phase after the event was applied.
    pub phase: String,
    pub command: Option<String>,
    pub outcome: Option<String>,
    pub msg: String,
}
