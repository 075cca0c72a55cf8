use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a mission ended in `FlightPhase::Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    NoHeartbeat,
    LinkLost,
    NoGpsFix,
    ModeUnknown,
    ModeRejected,
    PrearmFail,
    TakeoffRejected,
    Interrupted,
}

impl AbortReason {
    pub fn code(&self) -> &'static str {
        match self {
            AbortReason::NoHeartbeat => "NO_HEARTBEAT",
            AbortReason::LinkLost => "LINK_LOST",
            AbortReason::NoGpsFix => "NO_GPS_FIX",
            AbortReason::ModeUnknown => "MODE_UNKNOWN",
            AbortReason::ModeRejected => "MODE_REJECTED",
            AbortReason::PrearmFail => "PREARM_FAIL",
            AbortReason::TakeoffRejected => "TAKEOFF_REJECTED",
            AbortReason::Interrupted => "INTERRUPTED",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlightPhase {
    Idle,
    Connected,
    ModeSet,
    Armed,
    TakingOff,
    Airborne,
    Returning,
    Landed,
    Aborted(AbortReason),
}

impl FlightPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlightPhase::Landed | FlightPhase::Aborted(_))
    }

    /// Phases in which the vehicle may be off the ground.
    pub fn is_flying(&self) -> bool {
        matches!(self, FlightPhase::TakingOff | FlightPhase::Airborne | FlightPhase::Returning)
    }
}

impl fmt::Display for FlightPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightPhase::Aborted(reason) => write!(f, "Aborted({})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_phase_displays_reason_code() {
        let p = FlightPhase::Aborted(AbortReason::PrearmFail);
        assert_eq!(p.to_string(), "Aborted(PREARM_FAIL)");
        assert!(p.is_terminal());
        assert!(!p.is_flying());
        assert_eq!(FlightPhase::Airborne.to_string(), "Airborne");
    }
}
