//! Bounded waits on vehicle telemetry.
//!
//! The vehicle never acknowledges "takeoff complete" or "landed", so the
//! flight controller reads these streams where it can and falls back to
//! fixed waits where it cannot.

use std::sync::Arc;
use std::time::Duration;

use mavlink::ardupilotmega::{EkfStatusFlags, MavMessage};
use mavlink::MavHeader;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::link::{Link, Topic};

const PROGRESS_EVERY: Duration = Duration::from_secs(5);
const FIX_3D: u8 = 3;

/// Subset of `VFR_HUD` shown by `sortie watch`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hud {
    pub alt_m: f32,
    pub groundspeed: f32,
    pub heading: i16,
    pub throttle: u16,
}

pub struct Telemetry {
    link: Arc<Link>,
}

impl Telemetry {
    pub fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    fn from_target(&self, hdr: &MavHeader) -> bool {
        self.link.target().map_or(true, |t| t.system_id == hdr.system_id)
    }

    /// Wait for a 3D (or better) fix. Returns the fix type seen, `None` on
    /// timeout.
    pub async fn wait_for_gps_fix(&self, timeout: Duration) -> Option<u8> {
        let mut sub = self.link.subscribe(&[Topic::GpsRaw]);
        let deadline = Instant::now() + timeout;
        let mut next_report = Instant::now() + PROGRESS_EVERY;
        while let Some((hdr, msg)) = sub.recv_until(deadline).await {
            let MavMessage::GPS_RAW_INT(gps) = msg else { continue };
            if !self.from_target(&hdr) {
                continue;
            }
            let fix = gps.fix_type as u8;
            if fix >= FIX_3D {
                info!("gps: fix type {} with {} satellites", fix, gps.satellites_visible);
                return Some(fix);
            }
            if Instant::now() >= next_report {
                info!("gps: waiting for fix (type {}, {} satellites)", fix, gps.satellites_visible);
                next_report = Instant::now() + PROGRESS_EVERY;
            }
        }
        None
    }

    pub async fn next_ekf_status(&self, timeout: Duration) -> Option<EkfStatusFlags> {
        let mut sub = self.link.subscribe(&[Topic::EkfStatus]);
        let deadline = Instant::now() + timeout;
        while let Some((hdr, msg)) = sub.recv_until(deadline).await {
            if let MavMessage::EKF_STATUS_REPORT(ekf) = msg {
                if self.from_target(&hdr) {
                    info!("ekf: flags {:?}", ekf.flags);
                    return Some(ekf.flags);
                }
            }
        }
        None
    }

    /// Wait until the relative altitude reaches `target_m`. Returns the
    /// altitude reached, `None` on timeout.
    pub async fn wait_for_altitude(&self, target_m: f32, timeout: Duration) -> Option<f32> {
        let mut sub = self.link.subscribe(&[Topic::GlobalPosition]);
        let deadline = Instant::now() + timeout;
        while let Some((hdr, msg)) = sub.recv_until(deadline).await {
            let MavMessage::GLOBAL_POSITION_INT(pos) = msg else { continue };
            if !self.from_target(&hdr) {
                continue;
            }
            let alt = pos.relative_alt as f32 / 1000.0;
            debug!("telemetry: relative altitude {:.1} m", alt);
            if alt >= target_m {
                return Some(alt);
            }
        }
        None
    }

    /// First eight servo outputs, in µs.
    pub async fn next_servo_output(&self, timeout: Duration) -> Option<[u16; 8]> {
        let mut sub = self.link.subscribe(&[Topic::ServoOutput]);
        let deadline = Instant::now() + timeout;
        while let Some((hdr, msg)) = sub.recv_until(deadline).await {
            if let MavMessage::SERVO_OUTPUT_RAW(s) = msg {
                if self.from_target(&hdr) {
                    return Some([
                        s.servo1_raw,
                        s.servo2_raw,
                        s.servo3_raw,
                        s.servo4_raw,
                        s.servo5_raw,
                        s.servo6_raw,
                        s.servo7_raw,
                        s.servo8_raw,
                    ]);
                }
            }
        }
        None
    }

    pub async fn next_hud(&self, timeout: Duration) -> Option<Hud> {
        let mut sub = self.link.subscribe(&[Topic::VfrHud]);
        let deadline = Instant::now() + timeout;
        while let Some((hdr, msg)) = sub.recv_until(deadline).await {
            if let MavMessage::VFR_HUD(h) = msg {
                if self.from_target(&hdr) {
                    return Some(Hud { alt_m: h.alt, groundspeed: h.groundspeed, heading: h.heading, throttle: h.throttle });
                }
            }
        }
        None
    }
}
