use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mavlink::ardupilotmega::{
    MavCmd, MavFrame, MavMessage, MavResult, COMMAND_INT_DATA, COMMAND_LONG_DATA,
};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::FcError;
use crate::link::{Connection, Link, Topic};
use crate::modes::FlightMode;
use crate::safety::InFlight;

/// What a command does, for correlation and the one-per-kind rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandKind {
    ArmDisarm,
    SetMode,
    Takeoff,
    Land,
    ReturnToLaunch,
    Generic(MavCmd),
}

impl CommandKind {
    pub fn of(cmd: MavCmd) -> Self {
        match cmd {
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM => CommandKind::ArmDisarm,
            MavCmd::MAV_CMD_DO_SET_MODE => CommandKind::SetMode,
            MavCmd::MAV_CMD_NAV_TAKEOFF => CommandKind::Takeoff,
            MavCmd::MAV_CMD_NAV_LAND => CommandKind::Land,
            MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH => CommandKind::ReturnToLaunch,
            other => CommandKind::Generic(other),
        }
    }

    pub fn mav_cmd(&self) -> MavCmd {
        match self {
            CommandKind::ArmDisarm => MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            CommandKind::SetMode => MavCmd::MAV_CMD_DO_SET_MODE,
            CommandKind::Takeoff => MavCmd::MAV_CMD_NAV_TAKEOFF,
            CommandKind::Land => MavCmd::MAV_CMD_NAV_LAND,
            CommandKind::ReturnToLaunch => MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
            CommandKind::Generic(cmd) => *cmd,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::ArmDisarm => f.write_str("ARM_DISARM"),
            CommandKind::SetMode => f.write_str("SET_MODE"),
            CommandKind::Takeoff => f.write_str("TAKEOFF"),
            CommandKind::Land => f.write_str("LAND"),
            CommandKind::ReturnToLaunch => f.write_str("RTL"),
            CommandKind::Generic(cmd) => write!(f, "{:?}", cmd),
        }
    }
}

/// A request to the vehicle. Built per issuance and not changed afterwards;
/// the confirmation counter is supplied when each attempt is encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    pub params: [f32; 7],
}

impl Command {
    pub fn generic(cmd: MavCmd, params: [f32; 7]) -> Self {
        Self { kind: CommandKind::of(cmd), params }
    }

    pub fn arm() -> Self {
        Self::generic(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    pub fn disarm() -> Self {
        Self::generic(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0; 7])
    }

    pub fn set_mode(mode: &FlightMode) -> Self {
        let [base, main, sub] = mode.command_params();
        Self::generic(MavCmd::MAV_CMD_DO_SET_MODE, [base, main, sub, 0.0, 0.0, 0.0, 0.0])
    }

    /// Takeoff to `altitude_m` above home.
    pub fn takeoff(altitude_m: f32) -> Self {
        Self::generic(MavCmd::MAV_CMD_NAV_TAKEOFF, [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, altitude_m])
    }

    pub fn land() -> Self {
        Self::generic(MavCmd::MAV_CMD_NAV_LAND, [0.0; 7])
    }

    pub fn return_to_launch() -> Self {
        Self::generic(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, [0.0; 7])
    }

    /// Short name for logs and the journal; tells arm from disarm.
    pub fn label(&self) -> String {
        match self.kind {
            CommandKind::ArmDisarm if self.params[0] >= 0.5 => "ARM".into(),
            CommandKind::ArmDisarm => "DISARM".into(),
            kind => kind.to_string(),
        }
    }

    pub fn to_message(&self, target: Connection, confirmation: u8) -> MavMessage {
        let p = self.params;
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            param1: p[0],
            param2: p[1],
            param3: p[2],
            param4: p[3],
            param5: p[4],
            param6: p[5],
            param7: p[6],
            command: self.kind.mav_cmd(),
            target_system: target.system_id,
            target_component: target.component_id,
            confirmation,
        })
    }

    /// Same command as a `COMMAND_INT`; positional params 5..7 are not used
    /// by the commands sent this way.
    pub fn to_command_int(&self, target: Connection) -> MavMessage {
        let p = self.params;
        MavMessage::COMMAND_INT(COMMAND_INT_DATA {
            param1: p[0],
            param2: p[1],
            param3: p[2],
            param4: p[3],
            x: 0,
            y: 0,
            z: 0.0,
            command: self.kind.mav_cmd(),
            target_system: target.system_id,
            target_component: target.component_id,
            frame: MavFrame::MAV_FRAME_GLOBAL,
            current: 0,
            autocontinue: 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Accepted,
    /// Raw `MAV_RESULT` code.
    Rejected(u8),
    TimedOut,
}

impl CommandOutcome {
    pub fn into_result(self, kind: CommandKind, attempts: u32) -> Result<(), FcError> {
        match self {
            CommandOutcome::Accepted => Ok(()),
            CommandOutcome::Rejected(code) => Err(FcError::CommandRejected { kind, code }),
            CommandOutcome::TimedOut => Err(FcError::CommandTimedOut { kind, attempts }),
        }
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Accepted => f.write_str("ACCEPTED"),
            CommandOutcome::Rejected(code) => write!(f, "REJECTED({})", result_name(*code)),
            CommandOutcome::TimedOut => f.write_str("TIMED_OUT"),
        }
    }
}

pub fn result_name(code: u8) -> &'static str {
    match code {
        0 => "ACCEPTED",
        1 => "TEMPORARILY_REJECTED",
        2 => "DENIED",
        3 => "UNSUPPORTED",
        4 => "FAILED",
        5 => "IN_PROGRESS",
        6 => "CANCELLED",
        _ => "UNKNOWN",
    }
}

/// Request/response over `COMMAND_LONG` / `COMMAND_ACK`.
///
/// The vehicle does not echo any sequence number, so the first ack for the
/// same command from the target system after a send is taken as its answer.
/// That only works with one outstanding command per kind, which
/// [`InFlight`] enforces.
pub struct CommandChannel {
    link: Arc<Link>,
    in_flight: InFlight,
}

impl CommandChannel {
    pub fn new(link: Arc<Link>) -> Self {
        Self { link, in_flight: InFlight::new() }
    }

    /// Send `cmd`, retrying up to `max_retries` times when no ack arrives
    /// within `ack_timeout`. Errors only when nothing could be sent or the
    /// kind is already in flight; a refusal or silence is an outcome.
    pub async fn send(
        &self,
        cmd: &Command,
        ack_timeout: Duration,
        max_retries: u32,
    ) -> Result<CommandOutcome, FcError> {
        let target = self.link.target().ok_or(FcError::NotConnected)?;
        let _claim = self.in_flight.claim(cmd.kind).ok_or(FcError::CommandInFlight(cmd.kind))?;
        let mut acks = self.link.subscribe(&[Topic::CommandAck]);
        let want = cmd.kind.mav_cmd();
        let local = self.link.local();

        for attempt in 0..=max_retries {
            let confirmation = u8::try_from(attempt).unwrap_or(u8::MAX);
            self.link.send(&cmd.to_message(target, confirmation))?;
            debug!("cmd: {} sent (confirmation {})", cmd.label(), confirmation);

            let deadline = Instant::now() + ack_timeout;
            while let Some((hdr, msg)) = acks.recv_until(deadline).await {
                let MavMessage::COMMAND_ACK(ack) = msg else { continue };
                if ack.command != want || hdr.system_id != target.system_id {
                    trace!("cmd: ignoring ack {:?} from {}", ack.command, hdr.system_id);
                    continue;
                }
                // 0 means unaddressed; older autopilots never fill these in
                if (ack.target_system != 0 && ack.target_system != local.system_id)
                    || (ack.target_component != 0 && ack.target_component != local.component_id)
                {
                    trace!("cmd: ignoring ack for {}/{}", ack.target_system, ack.target_component);
                    continue;
                }
                match ack.result {
                    MavResult::MAV_RESULT_ACCEPTED => return Ok(CommandOutcome::Accepted),
                    MavResult::MAV_RESULT_IN_PROGRESS => {
                        debug!("cmd: {} in progress", cmd.label());
                    }
                    other => return Ok(CommandOutcome::Rejected(other as u8)),
                }
            }

            if attempt < max_retries {
                warn!(
                    "cmd: {} not acknowledged within {:?}, retrying ({}/{})",
                    cmd.label(),
                    ack_timeout,
                    attempt + 1,
                    max_retries
                );
            }
        }
        Ok(CommandOutcome::TimedOut)
    }

    /// Send once as `COMMAND_INT` without waiting for an ack. Callers confirm
    /// the effect some other way.
    pub fn send_once_int(&self, cmd: &Command) -> Result<(), FcError> {
        let target = self.link.target().ok_or(FcError::NotConnected)?;
        self.link.send(&cmd.to_command_int(target))?;
        debug!("cmd: {} sent as COMMAND_INT", cmd.label());
        Ok(())
    }

}
