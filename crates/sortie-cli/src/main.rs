mod keys;

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{info, warn};

use sortie_fc::doctor::{check_link, check_pwm, check_ramp, check_timing};
use sortie_fc::probe::{default_candidate_endpoints, probe_endpoints};
use sortie_fc::{setpoint, Activity, Descent, FcConfig, FlightController, Link, MissionStep, Sortie, Takeoff, ThrottleRamp};
use sortie_input::{RcConfig, RcMixer, VelocityConfig, VelocityMixer};
use sortie_proto::{FlightEvent, MotionSetpoint, SetpointSource};

use crate::keys::KeyboardSession;

#[derive(Debug, Parser)]
#[command(name = "sortie", version, about = "sortie - scripted and keyboard flights over MAVLink")]
struct Cli {
    #[arg(long)]
    config: String,

    /// Write the flight journal here as JSON lines.
    #[arg(long)]
    journal: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config file.
    Doctor,
    /// Try candidate endpoints until one carries a vehicle heartbeat.
    Probe,
    /// Print the vehicle's heartbeat, mode and HUD once a second.
    Watch {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Guided takeoff, the configured steps, then return or land.
    Mission,
    /// Keyboard velocity flight in the guided mode.
    Velocity,
    /// Keyboard RC-override flight in the manual mode.
    Rc,
    /// Throttle ramp, hold and ramp down. Props off.
    MotorTest,
    /// Send fixed overrides and print what the servos output.
    RcDiag,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    fc: FcConfig,
    mission: MissionCfg,
    manual: ManualCfg,
    motor_test: MotorTestCfg,
    diag: DiagCfg,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DescentChoice {
    Rtl,
    Land,
}

impl From<DescentChoice> for Descent {
    fn from(d: DescentChoice) -> Self {
        match d {
            DescentChoice::Rtl => Descent::ReturnToLaunch,
            DescentChoice::Land => Descent::Land,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ThrottleDown {
    to: u16,
    step: u16,
    step_ms: u64,
}

impl From<ThrottleDown> for Descent {
    fn from(d: ThrottleDown) -> Self {
        Descent::Throttle { to: d.to, step: d.step, step_ms: d.step_ms }
    }
}

const DEFAULT_THROTTLE_DOWN: ThrottleDown = ThrottleDown { to: 1200, step: 50, step_ms: 500 };

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MissionCfg {
    takeoff_alt_m: f32,
    preflight: bool,
    descent: DescentChoice,
    steps: Vec<MissionStep>,
}

impl Default for MissionCfg {
    fn default() -> Self {
        Self {
            takeoff_alt_m: 10.0,
            preflight: true,
            descent: DescentChoice::Rtl,
            steps: vec![MissionStep::Hold { duration_ms: 5000 }],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ManualCfg {
    /// Guided takeoff altitude for `velocity`.
    takeoff_alt_m: f32,
    preflight: bool,
    descent: DescentChoice,
    velocity: VelocityConfig,

    rc: RcConfig,
    rc_takeoff: ThrottleRamp,
    rc_descent: ThrottleDown,
}

impl Default for ManualCfg {
    fn default() -> Self {
        Self {
            takeoff_alt_m: 3.0,
            preflight: true,
            descent: DescentChoice::Land,
            velocity: VelocityConfig::default(),
            rc: RcConfig { initial_throttle: 1650, ..RcConfig::default() },
            rc_takeoff: ThrottleRamp { from: 1400, to: 1700, step: 50, step_ms: 1000 },
            rc_descent: DEFAULT_THROTTLE_DOWN,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MotorTestCfg {
    ramp: ThrottleRamp,
    hold_pwm: u16,
    hold_ms: u64,
    descent: ThrottleDown,
}

impl Default for MotorTestCfg {
    fn default() -> Self {
        Self {
            ramp: ThrottleRamp { from: 1400, to: 1800, step: 50, step_ms: 1000 },
            hold_pwm: 1700,
            hold_ms: 5000,
            descent: DEFAULT_THROTTLE_DOWN,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DiagCfg {
    iterations: u32,
    /// Roll, pitch, throttle, yaw.
    sticks: [u16; 4],
    wait_ms: u64,
}

impl Default for DiagCfg {
    fn default() -> Self {
        Self { iterations: 10, sticks: [1500, 1500, 1600, 1500], wait_ms: 500 }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    let cfg: Config = toml::from_str(&s).context("parse config toml")?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    let journal = cli.journal.as_deref();

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Probe => probe(&cfg).await?,
        Command::Watch { seconds } => watch(&cfg, Duration::from_secs(seconds)).await?,
        Command::Mission => mission(&cfg, journal).await?,
        Command::Velocity => velocity(&cfg, journal).await?,
        Command::Rc => rc(&cfg, journal).await?,
        Command::MotorTest => motor_test(&cfg, journal).await?,
        Command::RcDiag => rc_diag(&cfg, journal).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    check_link(&cfg.fc.link)?;
    check_timing(&cfg.fc.timing)?;
    anyhow::ensure!(
        cfg.fc.flight.takeoff_alt_fraction > 0.0 && cfg.fc.flight.takeoff_alt_fraction <= 1.0,
        "fc.flight.takeoff_alt_fraction should be in (0, 1]"
    );

    anyhow::ensure!(cfg.mission.takeoff_alt_m > 0.0, "mission.takeoff_alt_m must be > 0");
    if cfg.mission.steps.is_empty() {
        warn!("doctor: mission has no steps; it will take off and come straight back");
    }
    for (i, step) in cfg.mission.steps.iter().enumerate() {
        if let MissionStep::Throttle { .. } = step {
            anyhow::bail!("mission.steps[{}]: throttle steps need the rc flight, not a guided mission", i);
        }
    }

    anyhow::ensure!(cfg.manual.takeoff_alt_m > 0.0, "manual.takeoff_alt_m must be > 0");
    anyhow::ensure!(cfg.manual.velocity.max_speed > 0.0, "manual.velocity.max_speed must be > 0");
    check_pwm("manual.rc.initial_throttle", cfg.manual.rc.initial_throttle)?;
    check_ramp("manual.rc_takeoff", &cfg.manual.rc_takeoff)?;
    check_pwm("manual.rc_descent.to", cfg.manual.rc_descent.to)?;

    check_ramp("motor_test.ramp", &cfg.motor_test.ramp)?;
    check_pwm("motor_test.hold_pwm", cfg.motor_test.hold_pwm)?;
    check_pwm("motor_test.descent.to", cfg.motor_test.descent.to)?;

    for pwm in cfg.diag.sticks {
        check_pwm("diag.sticks", pwm)?;
    }

    info!("doctor: OK");
    Ok(())
}

async fn probe(cfg: &Config) -> Result<()> {
    let link = &cfg.fc.link;
    let candidates = link.candidate_endpoints.clone().unwrap_or_else(default_candidate_endpoints);
    let rep = probe_endpoints(candidates, Duration::from_millis(link.probe_timeout_ms), link.sys_id, link.comp_id).await;
    match &rep.chosen {
        Some(endpoint) => println!("CHOSEN: {}", endpoint),
        None => println!("CHOSEN: none"),
    }
    for p in rep.probes {
        println!("probe endpoint={} hb={} {}ms note={}", p.endpoint, p.hb_seen, p.elapsed_ms, p.note);
    }
    Ok(())
}

fn open_link(cfg: &Config) -> Result<Arc<Link>> {
    let l = &cfg.fc.link;
    Link::open(&l.endpoint, l.sys_id, l.comp_id).with_context(|| format!("open {}", l.endpoint))
}

async fn watch(cfg: &Config, duration: Duration) -> Result<()> {
    let mut fc = FlightController::new(open_link(cfg)?, cfg.fc.clone());
    fc.connect().await.context("connect")?;

    let end = Instant::now() + duration;
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    while Instant::now() < end {
        tick.tick().await;
        let Some(peer) = fc.heartbeat().peer() else { continue };
        let mode = fc.modes().and_then(|m| m.name_of(peer.custom_mode)).unwrap_or("?");
        println!(
            "vehicle={}/{} type={:?} mode={}({}) armed={} hb_age={:?}",
            peer.system_id,
            peer.component_id,
            peer.mavtype,
            mode,
            peer.custom_mode,
            peer.armed,
            fc.heartbeat().liveness().hb_age(),
        );
        if let Some(hud) = fc.telemetry().next_hud(Duration::from_millis(500)).await {
            println!(
                "  alt={:.1}m groundspeed={:.1}m/s heading={} throttle={}%",
                hud.alt_m, hud.groundspeed, hud.heading, hud.throttle
            );
        }
    }
    Ok(())
}

async fn mission(cfg: &Config, journal: Option<&Path>) -> Result<()> {
    let m = &cfg.mission;
    let sortie = Sortie {
        mode: cfg.fc.flight.guided_mode.clone(),
        preflight: m.preflight,
        takeoff: Takeoff::Guided { altitude_m: m.takeoff_alt_m },
        activity: Activity::Plan(m.steps.clone()),
        descent: m.descent.into(),
    };
    let mut fc = FlightController::new(open_link(cfg)?, cfg.fc.clone());
    let res = fc.execute(sortie, keys::interrupted(None)).await;
    finish(&fc, res, journal)
}

async fn velocity(cfg: &Config, journal: Option<&Path>) -> Result<()> {
    let man = &cfg.manual;
    let mixer = Arc::new(VelocityMixer::new(man.velocity.clone()));
    let live: Arc<dyn SetpointSource> = mixer.clone();
    let mut fc = FlightController::new(open_link(cfg)?, cfg.fc.clone()).with_live_source(live);

    println!("W/S A/D move, I/K climb/descend, Q/E yaw, Space stop, Esc return, Ctrl-C abort");
    let session = KeyboardSession::start(mixer)?;
    let sortie = Sortie {
        mode: cfg.fc.flight.guided_mode.clone(),
        preflight: man.preflight,
        takeoff: Takeoff::Guided { altitude_m: man.takeoff_alt_m },
        activity: Activity::Live(session.done()),
        descent: man.descent.into(),
    };
    let res = fc.execute(sortie, keys::interrupted(Some(session.interrupt()))).await;
    drop(session);
    finish(&fc, res, journal)
}

async fn rc(cfg: &Config, journal: Option<&Path>) -> Result<()> {
    let man = &cfg.manual;
    let mixer = Arc::new(RcMixer::new(man.rc.clone()));
    let live: Arc<dyn SetpointSource> = mixer.clone();
    let mut fc = FlightController::new(open_link(cfg)?, cfg.fc.clone()).with_live_source(live);

    println!("W/S pitch, A/D roll, Q/E yaw, Up/Down throttle, Space center, Esc descend, Ctrl-C abort");
    let session = KeyboardSession::start(mixer)?;
    let sortie = Sortie {
        mode: cfg.fc.flight.manual_mode.clone(),
        preflight: false,
        takeoff: Takeoff::Throttle(man.rc_takeoff),
        activity: Activity::Live(session.done()),
        descent: man.rc_descent.into(),
    };
    let res = fc.execute(sortie, keys::interrupted(Some(session.interrupt()))).await;
    drop(session);
    finish(&fc, res, journal)
}

async fn motor_test(cfg: &Config, journal: Option<&Path>) -> Result<()> {
    let mt = &cfg.motor_test;
    warn!("motor test: props off!");
    let sortie = Sortie {
        mode: cfg.fc.flight.manual_mode.clone(),
        preflight: false,
        takeoff: Takeoff::Throttle(mt.ramp),
        activity: Activity::Plan(vec![MissionStep::Throttle { pwm: mt.hold_pwm, duration_ms: mt.hold_ms }]),
        descent: mt.descent.into(),
    };
    let mut fc = FlightController::new(open_link(cfg)?, cfg.fc.clone());
    let res = fc.execute(sortie, keys::interrupted(None)).await;
    finish(&fc, res, journal)
}

async fn rc_diag(cfg: &Config, journal: Option<&Path>) -> Result<()> {
    let d = &cfg.diag;
    let mut fc = FlightController::new(open_link(cfg)?, cfg.fc.clone());
    let prepared = async {
        fc.connect().await?;
        fc.set_mode(&cfg.fc.flight.manual_mode).await?;
        fc.arm().await
    }
    .await;
    if let Err(e) = prepared {
        write_journal_if(journal, fc.journal())?;
        return Err(e).context("rc diag setup");
    }

    let [roll, pitch, throttle, yaw] = d.sticks;
    let sp = MotionSetpoint::sticks(roll, pitch, throttle, yaw);
    let wait = Duration::from_millis(d.wait_ms);
    let start = Instant::now();
    let sent = async {
        for i in 0..d.iterations {
            let Some(target) = fc.link().target() else { anyhow::bail!("lost vehicle target") };
            let boot_ms = u32::try_from(start.elapsed().as_millis()).unwrap_or(u32::MAX);
            fc.link().send(&setpoint::encode(&sp, target, boot_ms)).context("send override")?;
            match fc.telemetry().next_servo_output(wait).await {
                Some(servos) => println!("diag {}: sent {:?} servos {:?}", i + 1, d.sticks, servos),
                None => println!("diag {}: sent {:?} servos none", i + 1, d.sticks),
            }
            tokio::time::sleep(wait).await;
        }
        Ok(())
    };
    let res = tokio::select! {
        res = sent => res,
        _ = keys::interrupted(None) => {
            warn!("rc diag: interrupted");
            Ok(())
        }
    };

    let stood_down = fc.stand_down().await;
    write_journal_if(journal, fc.journal())?;
    res?;
    stood_down.context("disarm")
}

fn finish(fc: &FlightController, res: Result<(), sortie_fc::FlightError>, journal: Option<&Path>) -> Result<()> {
    write_journal_if(journal, fc.journal())?;
    println!("RESULT: {}", fc.phase());
    res.context("flight")
}

fn write_journal_if(path: Option<&Path>, events: &[FlightEvent]) -> Result<()> {
    match path {
        Some(path) => write_journal(path, events),
        None => Ok(()),
    }
}

fn write_journal(path: &Path, events: &[FlightEvent]) -> Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("create journal {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for ev in events {
        serde_json::to_writer(&mut w, ev).context("encode journal line")?;
        w.write_all(b"\n").context("write journal")?;
    }
    w.flush().context("write journal")?;
    info!("journal: {} events to {}", events.len(), path.display());
    Ok(())
}
