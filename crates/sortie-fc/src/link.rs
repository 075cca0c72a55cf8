use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use mavlink::ardupilotmega::MavMessage;
use mavlink::{MavConnection, MavHeader, MavlinkVersion};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, trace};

use crate::error::LinkError;

/// A decoded message together with the header it arrived with.
pub type Inbound = (MavHeader, MavMessage);

/// Remote system the commands are addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub system_id: u8,
    pub component_id: u8,
}

/// Inbound message families components can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Heartbeat,
    CommandAck,
    GpsRaw,
    EkfStatus,
    GlobalPosition,
    VfrHud,
    ServoOutput,
}

impl Topic {
    pub fn of(msg: &MavMessage) -> Option<Topic> {
        match msg {
            MavMessage::HEARTBEAT(_) => Some(Topic::Heartbeat),
            MavMessage::COMMAND_ACK(_) => Some(Topic::CommandAck),
            MavMessage::GPS_RAW_INT(_) => Some(Topic::GpsRaw),
            MavMessage::EKF_STATUS_REPORT(_) => Some(Topic::EkfStatus),
            MavMessage::GLOBAL_POSITION_INT(_) => Some(Topic::GlobalPosition),
            MavMessage::VFR_HUD(_) => Some(Topic::VfrHud),
            MavMessage::SERVO_OUTPUT_RAW(_) => Some(Topic::ServoOutput),
            _ => None,
        }
    }
}

/// Outgoing half of a link. Implementations only need to encode and write;
/// `Link` serializes callers.
pub trait Transport: Send + Sync {
    fn send(&self, header: &MavHeader, msg: &MavMessage) -> Result<(), LinkError>;
}

struct MavlinkTransport {
    conn: Arc<dyn MavConnection<MavMessage> + Send + Sync>,
}

impl Transport for MavlinkTransport {
    fn send(&self, header: &MavHeader, msg: &MavMessage) -> Result<(), LinkError> {
        self.conn
            .send(header, msg)
            .map(|_| ())
            .map_err(|e| LinkError::Send(format!("{:?}", e)))
    }
}

type Routes = Arc<Mutex<HashMap<Topic, Vec<UnboundedSender<Inbound>>>>>;

/// One MAVLink connection shared by every component of a flight.
///
/// Writes from the heartbeat emitter, the command channel and the setpoint
/// streamer go through a single lock so frames never interleave. Reads are
/// routed by topic to whoever subscribed; nobody listening means the
/// message is dropped.
pub struct Link {
    transport: Box<dyn Transport>,
    header: Mutex<MavHeader>,
    local: Connection,
    target: ArcSwapOption<Connection>,
    routes: Routes,
    dispatcher: JoinHandle<()>,
}

impl Link {
    /// Connect to `endpoint` (`udpin:`, `udpout:`, `tcpout:`, `serial:dev:baud`).
    ///
    /// Must be called from within a tokio runtime. The reader thread blocks in
    /// `recv` and only notices the link is gone after the next frame or read
    /// error, so the socket or port stays open until then. Callers opening many
    /// endpoints (see [`crate::probe`]) hold one idle reader per silent one.
    pub fn open(endpoint: &str, sys_id: u8, comp_id: u8) -> Result<Arc<Self>, LinkError> {
        if let Some(dev) = endpoint.strip_prefix("serial:") {
            let (path, baud) = dev.rsplit_once(':').ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("serial endpoint needs dev:baud, got {}", dev))
            })?;
            let baud: u32 = baud.parse().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("bad baud rate {}", baud))
            })?;
            // quick validate device
            let _ = tokio_serial::new(path, baud)
                .open_native_async()
                .map_err(std::io::Error::from)?;
        }

        let mut conn = mavlink::connect::<MavMessage>(endpoint)?;
        conn.set_protocol_version(MavlinkVersion::V2);
        let conn: Arc<dyn MavConnection<MavMessage> + Send + Sync> = Arc::from(conn);

        // mavlink recv blocks, so the reader gets its own thread. It exits on the
        // first frame after the link is dropped.
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = conn.clone();
        std::thread::Builder::new()
            .name("mav-reader".into())
            .spawn(move || loop {
                match reader.recv() {
                    Ok(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if tx.is_closed() {
                            break;
                        }
                        trace!("mavlink recv: {:?}", e);
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }
            })?;

        info!("link: opened {} as {}/{}", endpoint, sys_id, comp_id);
        Ok(Arc::new(Self::with_transport(Box::new(MavlinkTransport { conn }), rx, sys_id, comp_id)))
    }

    /// Build a link over any transport, fed by `inbound`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport(
        transport: Box<dyn Transport>,
        mut inbound: UnboundedReceiver<Inbound>,
        sys_id: u8,
        comp_id: u8,
    ) -> Self {
        let routes: Routes = Arc::default();
        let dispatcher = tokio::spawn({
            let routes = routes.clone();
            async move {
                while let Some((hdr, msg)) = inbound.recv().await {
                    dispatch(&routes, hdr, msg);
                }
                debug!("link: inbound stream ended");
            }
        });

        Self {
            transport,
            header: Mutex::new(MavHeader { system_id: sys_id, component_id: comp_id, sequence: 0 }),
            local: Connection { system_id: sys_id, component_id: comp_id },
            target: ArcSwapOption::from(None),
            routes,
            dispatcher,
        }
    }

    pub fn send(&self, msg: &MavMessage) -> Result<(), LinkError> {
        let mut hdr = lock(&self.header);
        hdr.sequence = hdr.sequence.wrapping_add(1);
        self.transport.send(&hdr, msg)
    }

    /// Receive every subsequent message of the given topics.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = lock(&self.routes);
        for topic in topics {
            routes.entry(*topic).or_default().push(tx.clone());
        }
        Subscription { rx }
    }

    /// Our own ids as written into every header.
    pub fn local(&self) -> Connection {
        self.local
    }

    /// The vehicle, once its first heartbeat has been seen.
    pub fn target(&self) -> Option<Connection> {
        self.target.load().as_deref().copied()
    }

    /// Record the vehicle we talk to. Only the first call has any effect.
    pub(crate) fn establish(&self, conn: Connection) -> bool {
        if self.target.load().is_some() {
            return false;
        }
        self.target.store(Some(Arc::new(conn)));
        true
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn dispatch(routes: &Routes, hdr: MavHeader, msg: MavMessage) {
    let Some(topic) = Topic::of(&msg) else {
        trace!("link: unrouted message id {} from {}", mavlink::Message::message_id(&msg), hdr.system_id);
        return;
    };
    let mut routes = lock(routes);
    let Some(subs) = routes.get_mut(&topic) else {
        trace!("link: no subscriber for {:?} from {}", topic, hdr.system_id);
        return;
    };
    subs.retain(|tx| tx.send((hdr, msg.clone())).is_ok());
    if subs.is_empty() {
        trace!("link: dropped {:?}, subscribers gone", topic);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stream of routed messages; dropping it unsubscribes.
pub struct Subscription {
    rx: UnboundedReceiver<Inbound>,
}

impl Subscription {
    /// Next message, or `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    /// Next message before `deadline`; `None` on timeout or closed link.
    pub async fn recv_until(&mut self, deadline: Instant) -> Option<Inbound> {
        tokio::time::timeout_at(deadline, self.rx.recv()).await.ok().flatten()
    }
}
