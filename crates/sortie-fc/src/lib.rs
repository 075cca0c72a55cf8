pub mod command;
pub mod doctor;
pub mod error;
pub mod flight;
pub mod heartbeat;
pub mod link;
pub mod loopback;
pub mod modes;
pub mod probe;
pub mod safety;
pub mod setpoint;
pub mod state;
pub mod streamer;
pub mod telemetry;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

pub use command::{Command, CommandChannel, CommandKind, CommandOutcome};
pub use error::{FcError, LinkError};
pub use flight::{Activity, Descent, FlightController, FlightError, MissionStep, Sortie, Takeoff, ThrottleRamp};
pub use heartbeat::{HeartbeatMonitor, PeerInfo};
pub use link::{Connection, Link, Topic};
pub use modes::{FlightMode, ModeMap};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FcConfig {
    pub link: LinkConfig,
    pub timing: Timing,
    pub flight: FlightConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// `udpin:host:port`, `udpout:host:port`, `tcpout:host:port` or
    /// `serial:/dev/ttyX:baud`.
    pub endpoint: String,

    /// MAVLink ids we use. 255/190 is the usual ground station pair.
    pub sys_id: u8,
    pub comp_id: u8,

    /// Endpoints `sortie probe` tries in order. Defaults to the SITL ports
    /// plus common serial devices.
    pub candidate_endpoints: Option<Vec<String>>,

    /// Heartbeat wait per probed endpoint.
    pub probe_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: "udpin:0.0.0.0:14550".into(),
            sys_id: 255,
            comp_id: 190,
            candidate_endpoints: None,
            probe_timeout_ms: 3000,
        }
    }
}

/// Every wait the controller does is bounded by one of these.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub heartbeat_interval_ms: u64,
    pub first_heartbeat_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_command_retries: u32,
    pub setpoint_rate_hz: u32,
    /// Upper bound on the climb to takeoff altitude.
    pub takeoff_settle_ms: u64,
    /// Upper bound on the descent before disarming.
    pub landing_settle_ms: u64,
    /// Peer silence after which an airborne flight is aborted.
    pub link_loss_ms: u64,
    pub mode_confirm_ms: u64,
    pub gps_fix_timeout_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            first_heartbeat_timeout_ms: 30_000,
            ack_timeout_ms: 3000,
            max_command_retries: 2,
            setpoint_rate_hz: 10,
            takeoff_settle_ms: 15_000,
            landing_settle_ms: 20_000,
            link_loss_ms: 5000,
            mode_confirm_ms: 2000,
            gps_fix_timeout_ms: 30_000,
        }
    }
}

impl Timing {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn first_heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.first_heartbeat_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn takeoff_settle(&self) -> Duration {
        Duration::from_millis(self.takeoff_settle_ms)
    }

    pub fn landing_settle(&self) -> Duration {
        Duration::from_millis(self.landing_settle_ms)
    }

    pub fn link_loss(&self) -> Duration {
        Duration::from_millis(self.link_loss_ms)
    }

    pub fn mode_confirm(&self) -> Duration {
        Duration::from_millis(self.mode_confirm_ms)
    }

    pub fn gps_fix_timeout(&self) -> Duration {
        Duration::from_millis(self.gps_fix_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    /// Mode for position/velocity setpoints.
    pub guided_mode: String,
    /// Mode that flies home and lands.
    pub return_mode: String,
    /// Mode for RC-override flights.
    pub manual_mode: String,

    /// Takeoff counts as done at this fraction of the requested altitude.
    pub takeoff_alt_fraction: f32,

    /// Abort instead of warn when no 3D fix arrives during preflight.
    pub require_gps_fix: bool,

    /// Extra or corrected name → custom mode entries.
    pub modes: BTreeMap<String, u32>,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            guided_mode: "GUIDED".into(),
            return_mode: "RTL".into(),
            manual_mode: "STABILIZE".into(),
            takeoff_alt_fraction: 0.95,
            require_gps_fix: false,
            modes: BTreeMap::new(),
        }
    }
}
