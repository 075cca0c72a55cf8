use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use mavlink::ardupilotmega::{MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::FcError;
use crate::link::{Connection, Link, Topic};
use crate::state::LivenessState;

/// What the vehicle last said about itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerInfo {
    pub system_id: u8,
    pub component_id: u8,
    pub autopilot: MavAutopilot,
    pub mavtype: MavType,
    pub custom_mode: u32,
    pub armed: bool,
}

/// Emits our heartbeat and tracks the vehicle's.
///
/// The first vehicle heartbeat establishes the link's target; afterwards only
/// that system/component is tracked. Heartbeats from other ground stations
/// are ignored.
pub struct HeartbeatMonitor {
    peer: watch::Receiver<Option<PeerInfo>>,
    liveness: Arc<ArcSwap<LivenessState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    pub fn start(link: Arc<Link>, interval: Duration) -> Self {
        let liveness = Arc::new(ArcSwap::from_pointee(LivenessState::default()));
        let (peer_tx, peer_rx) = watch::channel(None);

        let emitter = tokio::spawn({
            let link = link.clone();
            let liveness = liveness.clone();
            async move {
                let beat = gcs_heartbeat();
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                let mut failing = false;
                loop {
                    ticker.tick().await;
                    match link.send(&beat) {
                        Ok(()) => {
                            failing = false;
                            let now = Instant::now();
                            liveness.rcu(|st| LivenessState { last_sent: Some(now), ..**st });
                        }
                        Err(e) => {
                            if !failing {
                                warn!("heartbeat: send failed: {}", e);
                            }
                            failing = true;
                        }
                    }
                }
            }
        });

        let mut beats = link.subscribe(&[Topic::Heartbeat]);
        let tracker = tokio::spawn({
            let liveness = liveness.clone();
            async move {
                while let Some((hdr, msg)) = beats.recv().await {
                    let MavMessage::HEARTBEAT(hb) = msg else { continue };
                    if !is_vehicle(&hb) || hdr.system_id == link.local().system_id {
                        continue;
                    }
                    let from = Connection { system_id: hdr.system_id, component_id: hdr.component_id };
                    match link.target() {
                        Some(target) if target != from => {
                            debug!("heartbeat: ignoring {}/{}", from.system_id, from.component_id);
                            continue;
                        }
                        Some(_) => {}
                        None => {
                            if link.establish(from) {
                                info!("heartbeat from system {}, component {}", from.system_id, from.component_id);
                            }
                        }
                    }

                    let now = Instant::now();
                    liveness.rcu(|st| LivenessState { last_received: Some(now), ..**st });
                    peer_tx.send_replace(Some(PeerInfo {
                        system_id: from.system_id,
                        component_id: from.component_id,
                        autopilot: hb.autopilot,
                        mavtype: hb.mavtype,
                        custom_mode: hb.custom_mode,
                        armed: hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
                    }));
                }
            }
        });

        Self { peer: peer_rx, liveness, tasks: vec![emitter, tracker] }
    }

    /// Wait until the vehicle has been heard from once.
    pub async fn await_first_heartbeat(&self, timeout: Duration) -> Result<PeerInfo, FcError> {
        self.wait_peer(timeout, |_| true).await.ok_or(FcError::NoHeartbeat(timeout))
    }

    /// Wait until the vehicle reports `custom_mode` in its heartbeat.
    pub async fn await_mode(&self, custom_mode: u32, timeout: Duration) -> bool {
        self.wait_peer(timeout, |p| p.custom_mode == custom_mode).await.is_some()
    }

    pub async fn await_disarmed(&self, timeout: Duration) -> bool {
        self.wait_peer(timeout, |p| !p.armed).await.is_some()
    }

    async fn wait_peer(&self, timeout: Duration, mut pred: impl FnMut(&PeerInfo) -> bool) -> Option<PeerInfo> {
        let mut rx = self.peer.clone();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|p| p.as_ref().map_or(false, &mut pred)).await.map(|p| *p)
        })
        .await;
        match waited {
            Ok(Ok(peer)) => peer,
            _ => None,
        }
    }

    pub fn is_alive(&self, max_silence: Duration) -> bool {
        self.liveness().is_alive(max_silence)
    }

    pub fn liveness(&self) -> LivenessState {
        **self.liveness.load()
    }

    pub fn peer(&self) -> Option<PeerInfo> {
        *self.peer.borrow()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Autopilot heartbeats only; ground stations and peripherals on the
/// vehicle's system (companion computer, gimbal, ADS-B) never become the target.
pub(crate) fn is_vehicle(hb: &HEARTBEAT_DATA) -> bool {
    hb.autopilot != MavAutopilot::MAV_AUTOPILOT_INVALID
        && !matches!(
            hb.mavtype,
            MavType::MAV_TYPE_GCS
                | MavType::MAV_TYPE_ONBOARD_CONTROLLER
                | MavType::MAV_TYPE_GIMBAL
                | MavType::MAV_TYPE_ADSB
        )
}

fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}
