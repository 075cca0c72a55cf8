//! In-memory link with a scriptable vehicle end, for tests and dry runs.

use std::sync::Arc;

use mavlink::ardupilotmega::{
    MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavResult, MavState, MavType, COMMAND_ACK_DATA,
    HEARTBEAT_DATA,
};
use mavlink::MavHeader;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::LinkError;
use crate::link::{Inbound, Link, Transport};

struct LoopbackTransport {
    tx: UnboundedSender<MavMessage>,
}

impl Transport for LoopbackTransport {
    fn send(&self, _header: &MavHeader, msg: &MavMessage) -> Result<(), LinkError> {
        self.tx.send(msg.clone()).map_err(|_| LinkError::Closed)
    }
}

impl Link {
    /// A link whose other end is the returned [`Peer`].
    pub fn loopback(sys_id: u8, comp_id: u8) -> (Arc<Link>, Peer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let link = Link::with_transport(Box::new(LoopbackTransport { tx: out_tx }), in_rx, sys_id, comp_id);
        (Arc::new(link), Peer { injector: PeerInjector { tx: in_tx }, sent: out_rx })
    }
}

/// Vehicle side of a loopback link.
pub struct Peer {
    injector: PeerInjector,
    sent: UnboundedReceiver<MavMessage>,
}

impl Peer {
    pub const SYSTEM_ID: u8 = 1;
    pub const COMPONENT_ID: u8 = 1;

    /// Deliver `msg` to the link as if the vehicle sent it.
    pub fn inject(&self, msg: MavMessage) {
        self.injector.inject(msg);
    }

    pub fn injector(&self) -> PeerInjector {
        self.injector.clone()
    }

    /// Next message the link wrote, waiting for one.
    pub async fn next_sent(&mut self) -> Option<MavMessage> {
        self.sent.recv().await
    }

    /// Everything written so far, without waiting.
    pub fn drain(&mut self) -> Vec<MavMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.sent.try_recv() {
            out.push(msg);
        }
        out
    }
}

/// Cloneable handle for pushing vehicle messages from other tasks.
#[derive(Clone)]
pub struct PeerInjector {
    tx: UnboundedSender<Inbound>,
}

impl PeerInjector {
    pub fn inject(&self, msg: MavMessage) {
        let hdr = MavHeader { system_id: Peer::SYSTEM_ID, component_id: Peer::COMPONENT_ID, sequence: 0 };
        self.inject_from(hdr, msg);
    }

    pub fn inject_from(&self, header: MavHeader, msg: MavMessage) {
        let _ = self.tx.send((header, msg));
    }
}

/// Heartbeat of an ArduCopter quad in `custom_mode`.
pub fn vehicle_heartbeat(custom_mode: u32, armed: bool) -> MavMessage {
    let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
    if armed {
        base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
    }
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
        base_mode,
        system_status: MavState::MAV_STATE_STANDBY,
        mavlink_version: 3,
    })
}

pub fn command_ack(command: MavCmd, result: MavResult) -> MavMessage {
    MavMessage::COMMAND_ACK(COMMAND_ACK_DATA { command, result, ..Default::default() })
}
