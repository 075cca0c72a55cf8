use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sortie_proto::setpoint::RC_NEUTRAL;
use sortie_proto::{AbortReason, FlightEvent, FlightPhase, MotionSetpoint, SetpointSource};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::command::{Command, CommandChannel, CommandOutcome};
use crate::error::FcError;
use crate::heartbeat::{HeartbeatMonitor, PeerInfo};
use crate::link::Link;
use crate::modes::{FlightMode, ModeMap};
use crate::setpoint::SetpointBus;
use crate::streamer::SetpointStreamer;
use crate::telemetry::Telemetry;
use crate::FcConfig;

const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Throttle steps from `from` toward `to`, `to` itself excluded. Descends
/// when `to < from`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThrottleRamp {
    pub from: u16,
    pub to: u16,
    pub step: u16,
    pub step_ms: u64,
}

impl ThrottleRamp {
    pub fn values(&self) -> Vec<u16> {
        if self.step == 0 {
            return Vec::new();
        }
        let step = usize::from(self.step);
        if self.from <= self.to {
            (self.from..self.to).step_by(step).collect()
        } else {
            // descending, mirror of the above
            ((self.to + 1)..=self.from).rev().step_by(step).collect()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Takeoff {
    /// `NAV_TAKEOFF` in the guided mode.
    Guided { altitude_m: f32 },
    /// Ramp RC throttle in a manual mode.
    Throttle(ThrottleRamp),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Descent {
    /// Switch to the return mode and let the vehicle fly home.
    ReturnToLaunch,
    /// Land where we are.
    Land,
    /// Ramp RC throttle down from its current value.
    Throttle { to: u16, step: u16, step_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MissionStep {
    /// Fly to a local NED position, then wait.
    Goto { north: f32, east: f32, down: f32, dwell_ms: u64 },
    Velocity {
        vx: f32,
        vy: f32,
        vz: f32,
        #[serde(default)]
        yaw_rate: f32,
        duration_ms: u64,
    },
    Hold { duration_ms: u64 },
    Throttle { pwm: u16, duration_ms: u64 },
}

impl MissionStep {
    pub fn setpoint(&self) -> MotionSetpoint {
        match *self {
            MissionStep::Goto { north, east, down, .. } => MotionSetpoint::Position { north, east, down },
            MissionStep::Velocity { vx, vy, vz, yaw_rate, .. } => MotionSetpoint::Velocity { vx, vy, vz, yaw_rate },
            MissionStep::Hold { .. } => MotionSetpoint::HOLD,
            MissionStep::Throttle { pwm, .. } => MotionSetpoint::throttle_only(pwm),
        }
    }

    pub fn duration(&self) -> Duration {
        let ms = match *self {
            MissionStep::Goto { dwell_ms, .. } => dwell_ms,
            MissionStep::Velocity { duration_ms, .. }
            | MissionStep::Hold { duration_ms }
            | MissionStep::Throttle { duration_ms, .. } => duration_ms,
        };
        Duration::from_millis(ms)
    }
}

/// What happens while airborne.
pub enum Activity {
    /// Scripted steps, one after the other.
    Plan(Vec<MissionStep>),
    /// The live setpoint source flies until the receiver reads `true`.
    Live(watch::Receiver<bool>),
}

/// One flight from connect to landing.
pub struct Sortie {
    pub mode: String,
    pub preflight: bool,
    pub takeoff: Takeoff,
    pub activity: Activity,
    pub descent: Descent,
}

#[derive(Debug, Error)]
pub enum FlightError {
    #[error("aborted during {during}: {reason}")]
    Aborted { reason: AbortReason, during: FlightPhase },

    #[error("{action} not allowed in phase {phase}")]
    OutOfSequence { action: &'static str, phase: FlightPhase },

    #[error("flight interrupted by operator")]
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Guided,
    Throttle,
}

/// Sequences a flight over one link and owns its phase.
///
/// Every step is one command through the [`CommandChannel`] plus a guard.
/// "Takeoff complete" and "landed" have no acknowledgement, so those steps
/// read telemetry where available and otherwise wait the configured time.
pub struct FlightController {
    link: Arc<Link>,
    heartbeat: HeartbeatMonitor,
    commands: CommandChannel,
    telemetry: Telemetry,
    cfg: FcConfig,
    modes: Option<ModeMap>,
    phase: FlightPhase,
    control: Control,
    bus: Arc<SetpointBus>,
    streamer: Option<SetpointStreamer>,
    abort_ramp: (u16, u16, u64),
    takeoff_sent: bool,
    journal: Vec<FlightEvent>,
}

impl FlightController {
    /// Starts the heartbeat monitor, so must be called inside a runtime.
    pub fn new(link: Arc<Link>, cfg: FcConfig) -> Self {
        let heartbeat = HeartbeatMonitor::start(link.clone(), cfg.timing.heartbeat_interval());
        Self {
            commands: CommandChannel::new(link.clone()),
            telemetry: Telemetry::new(link.clone()),
            link,
            heartbeat,
            cfg,
            modes: None,
            phase: FlightPhase::Idle,
            control: Control::Guided,
            bus: Arc::new(SetpointBus::new(None)),
            streamer: None,
            abort_ramp: (1200, 50, 500),
            takeoff_sent: false,
            journal: Vec::new(),
        }
    }

    /// Setpoints from `source` are streamed whenever nothing is scripted.
    pub fn with_live_source(mut self, source: Arc<dyn SetpointSource>) -> Self {
        self.bus = Arc::new(SetpointBus::new(Some(source)));
        self
    }

    pub fn phase(&self) -> FlightPhase {
        self.phase
    }

    pub fn journal(&self) -> &[FlightEvent] {
        &self.journal
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn modes(&self) -> Option<&ModeMap> {
        self.modes.as_ref()
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    /// Run a whole flight. If `interrupt` resolves first, the flight is
    /// aborted and brought down the same way as any other failure.
    pub async fn execute(&mut self, sortie: Sortie, interrupt: impl Future<Output = ()>) -> Result<(), FlightError> {
        tokio::pin!(interrupt);
        let finished = {
            let run = self.run(sortie);
            tokio::select! {
                res = run => Some(res),
                _ = &mut interrupt => None,
            }
        };
        match finished {
            Some(res) => res,
            None => {
                warn!("flight: interrupted in {}", self.phase);
                self.abort(AbortReason::Interrupted).await;
                Err(FlightError::Interrupted)
            }
        }
    }

    async fn run(&mut self, sortie: Sortie) -> Result<(), FlightError> {
        if let Descent::Throttle { to, step, step_ms } = sortie.descent {
            self.abort_ramp = (to, step, step_ms);
        }
        self.connect().await?;
        if sortie.preflight {
            self.preflight().await?;
        }
        self.set_mode(&sortie.mode).await?;
        self.arm().await?;
        self.take_off(sortie.takeoff).await?;
        match sortie.activity {
            Activity::Plan(steps) => self.fly(&steps).await?,
            Activity::Live(mut done) => {
                self.bus.release();
                self.hold_until(async move {
                    let _ = done.wait_for(|d| *d).await;
                })
                .await?
            }
        }
        self.return_home(sortie.descent).await?;
        self.land().await
    }

    pub async fn connect(&mut self) -> Result<PeerInfo, FlightError> {
        self.require_phase("connect", &[FlightPhase::Idle])?;
        let peer = match self.heartbeat.await_first_heartbeat(self.cfg.timing.first_heartbeat_timeout()).await {
            Ok(peer) => peer,
            Err(e) => {
                error!("flight: {}", e);
                return Err(self.abort(AbortReason::NoHeartbeat).await);
            }
        };

        let modes = ModeMap::for_vehicle(peer.autopilot, peer.mavtype).with_overrides(&self.cfg.flight.modes);
        if modes.is_empty() {
            warn!("flight: no mode table for {:?}/{:?}; only configured modes are known", peer.autopilot, peer.mavtype);
        }
        self.modes = Some(modes);
        self.transition(
            FlightPhase::Connected,
            format!("vehicle {}/{} ({:?})", peer.system_id, peer.component_id, peer.mavtype),
        );
        Ok(peer)
    }

    /// Wait for a GPS fix and report EKF health. A missing fix only aborts
    /// when `require_gps_fix` is set.
    pub async fn preflight(&mut self) -> Result<(), FlightError> {
        self.require_phase("preflight", &[FlightPhase::Connected])?;
        match self.telemetry.wait_for_gps_fix(self.cfg.timing.gps_fix_timeout()).await {
            Some(fix) => self.record(None, None, format!("gps fix type {}", fix)),
            None if self.cfg.flight.require_gps_fix => {
                error!("flight: no 3D fix within {:?}", self.cfg.timing.gps_fix_timeout());
                return Err(self.abort(AbortReason::NoGpsFix).await);
            }
            None => warn!("flight: no 3D fix within {:?}, continuing", self.cfg.timing.gps_fix_timeout()),
        }
        if self.telemetry.next_ekf_status(self.cfg.timing.ack_timeout()).await.is_none() {
            warn!("flight: no EKF status report");
        }
        Ok(())
    }

    pub async fn set_mode(&mut self, name: &str) -> Result<(), FlightError> {
        self.require_phase("set_mode", &[FlightPhase::Connected, FlightPhase::ModeSet])?;
        let mode = match self.resolve(name) {
            Ok(mode) => mode,
            Err(e) => {
                error!("flight: {}", e);
                return Err(self.abort(AbortReason::ModeUnknown).await);
            }
        };
        if !self.switch_mode(&mode).await {
            return Err(self.abort(AbortReason::ModeRejected).await);
        }
        self.transition(FlightPhase::ModeSet, format!("mode {}", mode.name));
        Ok(())
    }

    pub async fn arm(&mut self) -> Result<(), FlightError> {
        self.require_phase("arm", &[FlightPhase::ModeSet])?;
        let cmd = Command::arm();
        let res = self.issue(&cmd).await.and_then(|o| o.into_result(cmd.kind, self.attempts()));
        match res {
            Ok(()) => {
                self.transition(FlightPhase::Armed, "armed".into());
                Ok(())
            }
            Err(e @ FcError::CommandRejected { .. }) => {
                error!("flight: cannot arm, {}; check pre-arm messages", e);
                Err(self.abort(AbortReason::PrearmFail).await)
            }
            Err(e) => {
                error!("flight: cannot arm, {}", e);
                Err(self.abort(AbortReason::PrearmFail).await)
            }
        }
    }

    pub async fn take_off(&mut self, takeoff: Takeoff) -> Result<(), FlightError> {
        self.require_phase("take_off", &[FlightPhase::Armed])?;
        match takeoff {
            Takeoff::Guided { altitude_m } => {
                self.control = Control::Guided;
                let cmd = Command::takeoff(altitude_m);
                // from here on an abort has to assume the vehicle may be climbing
                self.takeoff_sent = true;
                let res = self.issue(&cmd).await.and_then(|o| o.into_result(cmd.kind, self.attempts()));
                if let Err(e) = res {
                    if matches!(e, FcError::CommandRejected { .. }) {
                        self.takeoff_sent = false;
                    }
                    error!("flight: {}", e);
                    return Err(self.abort(AbortReason::TakeoffRejected).await);
                }
                self.transition(FlightPhase::TakingOff, format!("climbing to {:.1} m", altitude_m));

                let threshold = altitude_m * self.cfg.flight.takeoff_alt_fraction;
                let settle = self.cfg.timing.takeoff_settle();
                let reached = tokio::select! {
                    alt = self.telemetry.wait_for_altitude(threshold, settle) => alt,
                    lost = watch_liveness(&self.heartbeat, self.cfg.timing.link_loss()) => {
                        error!("flight: link lost after {:?} silence", lost);
                        return Err(self.abort(AbortReason::LinkLost).await);
                    }
                };
                let msg = match reached {
                    Some(alt) => format!("reached {:.1} m", alt),
                    None => {
                        warn!("flight: no altitude confirmation within {:?}, assuming airborne", settle);
                        format!("assumed airborne after {:?}", settle)
                    }
                };
                self.transition(FlightPhase::Airborne, msg);
            }
            Takeoff::Throttle(ramp) => {
                self.control = Control::Throttle;
                self.bus.script(MotionSetpoint::throttle_only(ramp.from));
                self.transition(FlightPhase::TakingOff, format!("throttle ramp {} -> {}", ramp.from, ramp.to));
                for pwm in ramp.values() {
                    self.bus.script(MotionSetpoint::throttle_only(pwm));
                    info!("flight: throttle {}", pwm);
                    tokio::time::sleep(Duration::from_millis(ramp.step_ms)).await;
                }
                self.transition(FlightPhase::Airborne, "throttle ramp done".into());
            }
        }
        Ok(())
    }

    /// Fly each step for its duration. The last setpoint is released
    /// afterwards.
    pub async fn fly(&mut self, steps: &[MissionStep]) -> Result<(), FlightError> {
        self.require_phase("fly", &[FlightPhase::Airborne])?;
        for (i, step) in steps.iter().enumerate() {
            self.bus.script(step.setpoint());
            self.record(None, None, format!("step {}: {:?}", i + 1, step));
            self.dwell(step.duration()).await?;
        }
        if self.control == Control::Guided {
            self.bus.release();
        }
        Ok(())
    }

    /// Stay airborne until `done` resolves, watching the link meanwhile.
    pub async fn hold_until(&mut self, done: impl Future<Output = ()>) -> Result<(), FlightError> {
        self.require_phase("hold_until", &[FlightPhase::Airborne])?;
        let max_silence = self.cfg.timing.link_loss();
        tokio::select! {
            _ = done => Ok(()),
            lost = watch_liveness(&self.heartbeat, max_silence) => {
                error!("flight: link lost after {:?} silence", lost);
                Err(self.abort(AbortReason::LinkLost).await)
            }
        }
    }

    pub async fn return_home(&mut self, descent: Descent) -> Result<(), FlightError> {
        self.require_phase("return_home", &[FlightPhase::Airborne])?;
        match descent {
            Descent::ReturnToLaunch => {
                self.transition(FlightPhase::Returning, "returning".into());
                self.fly_home().await;
            }
            Descent::Land => {
                self.transition(FlightPhase::Returning, "landing in place".into());
                let outcome = self.issue(&Command::land()).await;
                if !matches!(outcome, Ok(CommandOutcome::Accepted)) {
                    warn!("flight: land not accepted, returning instead");
                    self.fly_home().await;
                }
            }
            Descent::Throttle { to, step, step_ms } => {
                self.transition(FlightPhase::Returning, format!("throttle down to {}", to));
                self.throttle_down(to, step, step_ms).await;
            }
        }
        Ok(())
    }

    /// Wait for touchdown, then disarm. Ends in `Landed` even when the
    /// disarm is not acknowledged.
    pub async fn land(&mut self) -> Result<(), FlightError> {
        self.require_phase("land", &[FlightPhase::Returning])?;
        self.settle_and_disarm().await;
        self.transition(FlightPhase::Landed, "landed".into());
        Ok(())
    }

    /// Disarm a vehicle that never took off.
    pub async fn stand_down(&mut self) -> Result<(), FlightError> {
        self.require_phase("stand_down", &[FlightPhase::Armed])?;
        self.disarm().await;
        self.transition(FlightPhase::Landed, "stood down".into());
        Ok(())
    }

    /// Bring the vehicle to a safe state from wherever it is and end in
    /// `Aborted(reason)`.
    pub async fn abort(&mut self, reason: AbortReason) -> FlightError {
        let during = self.phase;
        if during.is_terminal() {
            return FlightError::Aborted { reason, during };
        }
        error!("flight: abort {} during {}", reason, during);

        let maybe_airborne = during.is_flying() || (during == FlightPhase::Armed && self.takeoff_sent);
        if maybe_airborne {
            if during != FlightPhase::Returning {
                self.transition(FlightPhase::Returning, format!("abort {}", reason));
            }
            match self.control {
                Control::Throttle => {
                    let (to, step, step_ms) = self.abort_ramp;
                    self.throttle_down(to, step, step_ms).await;
                }
                Control::Guided => self.fly_home().await,
            }
            self.settle_and_disarm().await;
        } else if during == FlightPhase::Armed {
            self.disarm().await;
        }

        self.transition(FlightPhase::Aborted(reason), format!("aborted during {}", during));
        FlightError::Aborted { reason, during }
    }

    /// Return mode first; the RTL command if the mode is unknown or refused.
    async fn fly_home(&mut self) {
        let name = self.cfg.flight.return_mode.clone();
        match self.resolve(&name) {
            Ok(mode) => {
                if self.switch_mode(&mode).await {
                    return;
                }
                warn!("flight: {} refused, sending return-to-launch", name);
            }
            Err(e) => warn!("flight: {}, sending return-to-launch", e),
        }
        if !matches!(self.issue(&Command::return_to_launch()).await, Ok(CommandOutcome::Accepted)) {
            error!("flight: return-to-launch not accepted");
        }
    }

    async fn throttle_down(&mut self, to: u16, step: u16, step_ms: u64) {
        let from = self.bus.current_setpoint().throttle().unwrap_or(RC_NEUTRAL);
        let ramp = ThrottleRamp { from, to, step, step_ms };
        for pwm in ramp.values() {
            self.bus.script(MotionSetpoint::throttle_only(pwm));
            info!("flight: throttle {}", pwm);
            tokio::time::sleep(Duration::from_millis(step_ms)).await;
        }
        self.bus.script(MotionSetpoint::throttle_only(to));
    }

    async fn settle_and_disarm(&mut self) {
        let settle = self.cfg.timing.landing_settle();
        if self.heartbeat.await_disarmed(settle).await {
            self.record(None, None, "vehicle reports disarmed".into());
            return;
        }
        warn!("flight: no touchdown signal within {:?}, disarming", settle);
        self.disarm().await;
    }

    async fn disarm(&mut self) {
        match self.issue(&Command::disarm()).await {
            Ok(CommandOutcome::Accepted) => {}
            Ok(outcome) => warn!("flight: disarm {}", outcome),
            Err(e) => warn!("flight: disarm failed: {}", e),
        }
    }

    /// `DO_SET_MODE` with retries; if that fails, one direct `COMMAND_INT`
    /// confirmed by the vehicle's heartbeat.
    async fn switch_mode(&mut self, mode: &FlightMode) -> bool {
        let cmd = Command::set_mode(mode);
        let confirm = self.cfg.timing.mode_confirm();
        match self.issue(&cmd).await {
            Ok(CommandOutcome::Accepted) => {
                if !self.heartbeat.await_mode(mode.custom_mode, confirm).await {
                    warn!("flight: {} accepted but not yet reported by vehicle", mode.name);
                }
                return true;
            }
            Ok(outcome) => warn!("flight: set mode {} {}, trying direct mode set", mode.name, outcome),
            Err(e) => warn!("flight: set mode {} failed: {}, trying direct mode set", mode.name, e),
        }

        if let Err(e) = self.commands.send_once_int(&cmd) {
            error!("flight: direct mode set failed: {}", e);
            return false;
        }
        let confirmed = self.heartbeat.await_mode(mode.custom_mode, confirm).await;
        let outcome = if confirmed { "CONFIRMED" } else { "UNCONFIRMED" };
        self.record(Some(format!("{} (direct)", cmd.label())), Some(outcome.into()), format!("mode {}", mode.name));
        confirmed
    }

    async fn issue(&mut self, cmd: &Command) -> Result<CommandOutcome, FcError> {
        let timing = &self.cfg.timing;
        let (ack_timeout, retries) = (timing.ack_timeout(), timing.max_command_retries);
        let res = self.commands.send(cmd, ack_timeout, retries).await;
        let outcome = match &res {
            Ok(CommandOutcome::TimedOut) => {
                warn!("flight: {} got no ack after {} attempts", cmd.label(), retries + 1);
                CommandOutcome::TimedOut.to_string()
            }
            Ok(outcome) => outcome.to_string(),
            Err(e) => format!("ERROR({})", e),
        };
        self.record(Some(cmd.label()), Some(outcome), String::new());
        res
    }

    fn attempts(&self) -> u32 {
        self.cfg.timing.max_command_retries + 1
    }

    /// Sleep for `d` unless the link goes quiet first.
    async fn dwell(&mut self, d: Duration) -> Result<(), FlightError> {
        let max_silence = self.cfg.timing.link_loss();
        tokio::select! {
            _ = tokio::time::sleep(d) => Ok(()),
            lost = watch_liveness(&self.heartbeat, max_silence) => {
                error!("flight: link lost after {:?} silence", lost);
                Err(self.abort(AbortReason::LinkLost).await)
            }
        }
    }

    fn resolve(&self, name: &str) -> Result<FlightMode, FcError> {
        match &self.modes {
            Some(modes) => modes.resolve(name),
            None => Err(FcError::NotConnected),
        }
    }

    fn require_phase(&self, action: &'static str, allowed: &[FlightPhase]) -> Result<(), FlightError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(FlightError::OutOfSequence { action, phase: self.phase })
        }
    }

    fn transition(&mut self, to: FlightPhase, msg: String) {
        let from = self.phase;
        self.phase = to;
        info!("flight: {} -> {} {}", from, to, msg);
        self.record(None, None, msg);
        self.sync_streamer();
    }

    fn streams_in(&self, phase: FlightPhase) -> bool {
        match self.control {
            Control::Guided => phase == FlightPhase::Airborne,
            Control::Throttle => phase.is_flying(),
        }
    }

    fn sync_streamer(&mut self) {
        let wanted = self.streams_in(self.phase);
        match (wanted, self.streamer.take()) {
            (true, None) => {
                let rate = self.cfg.timing.setpoint_rate_hz;
                self.streamer = Some(SetpointStreamer::start(self.link.clone(), self.bus.clone(), rate));
            }
            (true, running) => self.streamer = running,
            (false, Some(streamer)) => info!("flight: streamer stopped, {} setpoints sent", streamer.published()),
            (false, None) => {}
        }
    }

    fn record(&mut self, command: Option<String>, outcome: Option<String>, msg: String) {
        let ts_unix_ms = i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX);
        self.journal.push(FlightEvent { ts_unix_ms, phase: self.phase.to_string(), command, outcome, msg });
    }
}

/// Resolves once the peer has been silent longer than `max_silence`.
async fn watch_liveness(heartbeat: &HeartbeatMonitor, max_silence: Duration) -> Duration {
    loop {
        tokio::time::sleep(LIVENESS_POLL).await;
        if !heartbeat.is_alive(max_silence) {
            return heartbeat.liveness().hb_age().unwrap_or(max_silence);
        }
    }
}
