use std::time::Duration;

use mavlink::ardupilotmega::{MavMessage, MavType};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::heartbeat::is_vehicle;
use crate::link::{Link, Topic};

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub endpoint: String,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub chosen: Option<String>,
    pub probes: Vec<ProbeResult>,
}

/// SITL ports first, then the usual USB and UART autopilot devices.
pub fn default_candidate_endpoints() -> Vec<String> {
    vec![
        "udpin:0.0.0.0:14550".into(),
        "tcpout:127.0.0.1:5760".into(),
        "tcpout:127.0.0.1:5762".into(),
        "serial:/dev/ttyACM0:115200".into(),
        "serial:/dev/ttyUSB0:57600".into(),
        "serial:/dev/serial0:921600".into(),
    ]
}

/// Open each endpoint in turn and stop at the first one a vehicle
/// heartbeat arrives on. Silent endpoints stay bound by their reader thread
/// until traffic or an error wakes it; `sortie probe` exits right after.
pub async fn probe_endpoints(
    candidates: Vec<String>,
    heartbeat_timeout: Duration,
    sys_id: u8,
    comp_id: u8,
) -> ProbeReport {
    let mut probes = Vec::new();

    for endpoint in candidates {
        let start = Instant::now();
        let (hb_seen, note) = match Link::open(&endpoint, sys_id, comp_id) {
            Ok(link) => match first_vehicle_heartbeat(&link, start + heartbeat_timeout).await {
                Some((sys, mavtype)) => (true, format!("heartbeat from system {} ({:?})", sys, mavtype)),
                None => (false, "no heartbeat".to_string()),
            },
            Err(e) => {
                warn!("probe: {} failed: {}", endpoint, e);
                (false, format!("open failed: {}", e))
            }
        };

        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        probes.push(ProbeResult { endpoint: endpoint.clone(), hb_seen, elapsed_ms, note });
        if hb_seen {
            info!("probe: OK {}", endpoint);
            return ProbeReport { chosen: Some(endpoint), probes };
        }
    }

    ProbeReport { chosen: None, probes }
}

async fn first_vehicle_heartbeat(link: &Link, deadline: Instant) -> Option<(u8, MavType)> {
    let mut beats = link.subscribe(&[Topic::Heartbeat]);
    while let Some((hdr, msg)) = beats.recv_until(deadline).await {
        if let MavMessage::HEARTBEAT(hb) = msg {
            if is_vehicle(&hb) {
                return Some((hdr.system_id, hb.mavtype));
            }
        }
    }
    None
}
