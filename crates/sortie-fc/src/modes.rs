//! Mode name tables, picked from the peer heartbeat's autopilot and vehicle
//! type. MAVLink 0.12 has no message to fetch the list from the vehicle.

use std::collections::BTreeMap;

use mavlink::ardupilotmega::{MavAutopilot, MavType};

use crate::error::FcError;

const ARDUCOPTER: &[(&str, u32)] = &[
    ("STABILIZE", 0),
    ("ACRO", 1),
    ("ALT_HOLD", 2),
    ("AUTO", 3),
    ("GUIDED", 4),
    ("LOITER", 5),
    ("RTL", 6),
    ("CIRCLE", 7),
    ("LAND", 9),
    ("DRIFT", 11),
    ("SPORT", 13),
    ("FLIP", 14),
    ("AUTOTUNE", 15),
    ("POSHOLD", 16),
    ("BRAKE", 17),
    ("THROW", 18),
    ("AVOID_ADSB", 19),
    ("GUIDED_NOGPS", 20),
    ("SMART_RTL", 21),
    ("FLOWHOLD", 22),
    ("FOLLOW", 23),
    ("ZIGZAG", 24),
    ("SYSTEMID", 25),
    ("AUTOROTATE", 26),
    ("AUTO_RTL", 27),
];

const ARDUPLANE: &[(&str, u32)] = &[
    ("MANUAL", 0),
    ("CIRCLE", 1),
    ("STABILIZE", 2),
    ("TRAINING", 3),
    ("ACRO", 4),
    ("FBWA", 5),
    ("FBWB", 6),
    ("CRUISE", 7),
    ("AUTOTUNE", 8),
    ("AUTO", 10),
    ("RTL", 11),
    ("LOITER", 12),
    ("TAKEOFF", 13),
    ("AVOID_ADSB", 14),
    ("GUIDED", 15),
    ("QSTABILIZE", 17),
    ("QHOVER", 18),
    ("QLOITER", 19),
    ("QLAND", 20),
    ("QRTL", 21),
    ("QAUTOTUNE", 22),
    ("QACRO", 23),
    ("THERMAL", 24),
];

const ARDUROVER: &[(&str, u32)] = &[
    ("MANUAL", 0),
    ("ACRO", 1),
    ("STEERING", 3),
    ("HOLD", 4),
    ("LOITER", 5),
    ("FOLLOW", 6),
    ("SIMPLE", 7),
    ("AUTO", 10),
    ("RTL", 11),
    ("SMART_RTL", 12),
    ("GUIDED", 15),
];

const ARDUSUB: &[(&str, u32)] = &[
    ("STABILIZE", 0),
    ("ACRO", 1),
    ("ALT_HOLD", 2),
    ("AUTO", 3),
    ("GUIDED", 4),
    ("CIRCLE", 7),
    ("SURFACE", 9),
    ("POSHOLD", 16),
    ("MANUAL", 19),
];

// PX4 packs main mode into bits 16..24 and sub mode into 24..32.
const PX4: &[(&str, u32, u32)] = &[
    ("MANUAL", 1, 0),
    ("ALTCTL", 2, 0),
    ("POSCTL", 3, 0),
    ("ACRO", 5, 0),
    ("OFFBOARD", 6, 0),
    ("STABILIZED", 7, 0),
    ("AUTO.TAKEOFF", 4, 2),
    ("AUTO.LOITER", 4, 3),
    ("AUTO.MISSION", 4, 4),
    ("AUTO.RTL", 4, 5),
    ("AUTO.LAND", 4, 6),
];

/// How a custom mode is put into `DO_SET_MODE` params.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeEncoding {
    ArduPilot,
    Px4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightMode {
    pub name: String,
    pub custom_mode: u32,
    pub encoding: ModeEncoding,
}

impl FlightMode {
    /// `DO_SET_MODE` param1..3. param1 is MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.
    pub fn command_params(&self) -> [f32; 3] {
        match self.encoding {
            ModeEncoding::ArduPilot => [1.0, self.custom_mode as f32, 0.0],
            ModeEncoding::Px4 => {
                let main = (self.custom_mode >> 16) & 0xff;
                let sub = (self.custom_mode >> 24) & 0xff;
                [1.0, main as f32, sub as f32]
            }
        }
    }
}

/// Mode names the connected vehicle understands.
///
/// Built from the autopilot and vehicle type in the peer's heartbeat, so the
/// same name can mean different numbers on a copter and a plane.
#[derive(Debug, Clone)]
pub struct ModeMap {
    modes: BTreeMap<String, u32>,
    encoding: ModeEncoding,
}

impl ModeMap {
    pub fn for_vehicle(autopilot: MavAutopilot, mavtype: MavType) -> Self {
        if autopilot == MavAutopilot::MAV_AUTOPILOT_PX4 {
            let modes = PX4.iter().map(|(n, main, sub)| (n.to_string(), (main << 16) | (sub << 24))).collect();
            return Self { modes, encoding: ModeEncoding::Px4 };
        }
        if autopilot != MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA {
            return Self { modes: BTreeMap::new(), encoding: ModeEncoding::ArduPilot };
        }

        let table: &[(&str, u32)] = match mavtype {
            MavType::MAV_TYPE_QUADROTOR
            | MavType::MAV_TYPE_HEXAROTOR
            | MavType::MAV_TYPE_OCTOROTOR
            | MavType::MAV_TYPE_TRICOPTER
            | MavType::MAV_TYPE_COAXIAL
            | MavType::MAV_TYPE_HELICOPTER => ARDUCOPTER,
            MavType::MAV_TYPE_FIXED_WING => ARDUPLANE,
            MavType::MAV_TYPE_GROUND_ROVER | MavType::MAV_TYPE_SURFACE_BOAT => ARDUROVER,
            MavType::MAV_TYPE_SUBMARINE => ARDUSUB,
            _ => &[],
        };
        let modes = table.iter().map(|(n, id)| (n.to_string(), *id)).collect();
        Self { modes, encoding: ModeEncoding::ArduPilot }
    }

    /// Add or replace entries, e.g. from `[fc.flight.modes]`.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, u32>) -> Self {
        for (name, id) in overrides {
            self.modes.insert(name.to_ascii_uppercase(), *id);
        }
        self
    }

    pub fn resolve(&self, name: &str) -> Result<FlightMode, FcError> {
        let key = name.to_ascii_uppercase();
        match self.modes.get(&key) {
            Some(id) => Ok(FlightMode { name: key, custom_mode: *id, encoding: self.encoding }),
            None => Err(FcError::ModeUnknown { name: name.to_string(), available: self.available() }),
        }
    }

    /// Reverse lookup for display.
    pub fn name_of(&self, custom_mode: u32) -> Option<&str> {
        self.modes.iter().find(|(_, id)| **id == custom_mode).map(|(n, _)| n.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    fn available(&self) -> String {
        if self.modes.is_empty() {
            return "none".into();
        }
        self.modes.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
    }
}
