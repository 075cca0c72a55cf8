mod common;

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use mavlink::ardupilotmega::{MavCmd, MavResult};
use sortie_fc::setpoint::SetpointBus;
use sortie_fc::streamer::SetpointStreamer;
use sortie_fc::{
    Activity, Command, CommandChannel, CommandOutcome, Descent, FlightController, FlightError, HeartbeatMonitor,
    MissionStep, Sortie, Takeoff, ThrottleRamp,
};
use sortie_proto::{AbortReason, FlightPhase, MotionSetpoint, SetpointSource};
use tokio::sync::watch;

use common::{sim, test_config, Policy, Reply, GUIDED, RTL, STABILIZE};

fn guided_sortie(mode: &str, steps: Vec<MissionStep>) -> Sortie {
    Sortie {
        mode: mode.into(),
        preflight: false,
        takeoff: Takeoff::Guided { altitude_m: 10.0 },
        activity: Activity::Plan(steps),
        descent: Descent::ReturnToLaunch,
    }
}

fn is_mode(c: &mavlink::ardupilotmega::COMMAND_LONG_DATA, custom: u32) -> bool {
    c.command == MavCmd::MAV_CMD_DO_SET_MODE && c.param2 as u32 == custom
}

fn is_disarm(c: &mavlink::ardupilotmega::COMMAND_LONG_DATA) -> bool {
    c.command == MavCmd::MAV_CMD_COMPONENT_ARM_DISARM && c.param1 < 0.5
}

struct Fixed(MotionSetpoint);

impl SetpointSource for Fixed {
    fn current_setpoint(&self) -> MotionSetpoint {
        self.0
    }
}

#[tokio::test(start_paused = true)]
async fn guided_mission_flies_and_lands() {
    let (link, sim) = sim(Policy::default());
    let mut fc = FlightController::new(link, test_config());
    let steps = vec![
        MissionStep::Goto { north: 10.0, east: 0.0, down: -10.0, dwell_ms: 2000 },
        MissionStep::Hold { duration_ms: 1000 },
    ];

    fc.execute(guided_sortie("GUIDED", steps), pending()).await.unwrap();
    assert_eq!(fc.phase(), FlightPhase::Landed);

    let guided = sim.position(|c| is_mode(c, GUIDED)).unwrap();
    let arm = sim.position(|c| c.command == MavCmd::MAV_CMD_COMPONENT_ARM_DISARM && c.param1 >= 0.5).unwrap();
    let takeoff = sim.position(|c| c.command == MavCmd::MAV_CMD_NAV_TAKEOFF).unwrap();
    let rtl = sim.position(|c| is_mode(c, RTL)).unwrap();
    let disarm = sim.position(is_disarm).unwrap();
    assert!(guided < arm && arm < takeoff && takeoff < rtl && rtl < disarm);
    assert_eq!(sim.count(MavCmd::MAV_CMD_NAV_TAKEOFF), 1);

    // guided setpoints only between takeoff and the return
    let trace = sim.trace();
    let streamed: Vec<usize> = trace
        .iter()
        .enumerate()
        .filter(|(_, (_, m))| matches!(m, mavlink::ardupilotmega::MavMessage::SET_POSITION_TARGET_LOCAL_NED(_)))
        .map(|(i, _)| i)
        .collect();
    assert!(streamed.len() >= 25, "only {} setpoints", streamed.len());
    assert!(streamed.iter().all(|i| *i > takeoff && *i < rtl));

    let journal = fc.journal();
    assert!(journal.iter().any(|e| e.command.as_deref() == Some("ARM") && e.outcome.as_deref() == Some("ACCEPTED")));
    assert_eq!(journal.last().map(|e| e.phase.as_str()), Some("Landed"));
}

#[tokio::test(start_paused = true)]
async fn refused_arm_aborts_without_takeoff() {
    let policy = Policy { arm: Reply::Ack(MavResult::MAV_RESULT_FAILED), ..Policy::default() };
    let (link, sim) = sim(policy);
    let mut fc = FlightController::new(link, test_config());

    let err = fc.execute(guided_sortie("GUIDED", vec![]), pending()).await.unwrap_err();
    assert!(matches!(
        err,
        FlightError::Aborted { reason: AbortReason::PrearmFail, during: FlightPhase::ModeSet }
    ));
    assert_eq!(fc.phase(), FlightPhase::Aborted(AbortReason::PrearmFail));
    assert_eq!(sim.count(MavCmd::MAV_CMD_NAV_TAKEOFF), 0);
    // a refusal is an answer, not a reason to retry
    assert_eq!(sim.count(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_mode_sends_no_commands() {
    let (link, sim) = sim(Policy::default());
    let mut fc = FlightController::new(link, test_config());

    let err = fc.execute(guided_sortie("WARP", vec![]), pending()).await.unwrap_err();
    assert!(matches!(err, FlightError::Aborted { reason: AbortReason::ModeUnknown, .. }));
    assert!(sim.commands().is_empty());
    assert!(sim.command_ints().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_mode_change_falls_back_to_direct_set() {
    let policy = Policy { set_mode: Reply::Silent, ..Policy::default() };
    let (link, sim) = sim(policy);
    let mut fc = FlightController::new(link, test_config());

    fc.connect().await.unwrap();
    fc.set_mode("GUIDED").await.unwrap();
    assert_eq!(fc.phase(), FlightPhase::ModeSet);
    assert_eq!(sim.count(MavCmd::MAV_CMD_DO_SET_MODE), 3);
    let ints = sim.command_ints();
    assert_eq!(ints.len(), 1);
    assert_eq!(ints[0].param2 as u32, GUIDED);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_fallback_is_mode_rejected() {
    let policy = Policy {
        set_mode: Reply::Ack(MavResult::MAV_RESULT_DENIED),
        honor_command_int: false,
        ..Policy::default()
    };
    let (link, sim) = sim(policy);
    let mut fc = FlightController::new(link, test_config());

    fc.connect().await.unwrap();
    let err = fc.set_mode("GUIDED").await.unwrap_err();
    assert!(matches!(err, FlightError::Aborted { reason: AbortReason::ModeRejected, during: FlightPhase::Connected }));
    assert_eq!(sim.count(MavCmd::MAV_CMD_DO_SET_MODE), 1);
    assert_eq!(sim.count(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM), 0);
}

#[tokio::test(start_paused = true)]
async fn takeoff_is_not_repeated_once_airborne() {
    let (link, sim) = sim(Policy::default());
    let mut fc = FlightController::new(link, test_config());

    fc.connect().await.unwrap();
    fc.set_mode("GUIDED").await.unwrap();
    fc.arm().await.unwrap();
    fc.take_off(Takeoff::Guided { altitude_m: 10.0 }).await.unwrap();
    assert_eq!(fc.phase(), FlightPhase::Airborne);

    let err = fc.take_off(Takeoff::Guided { altitude_m: 20.0 }).await.unwrap_err();
    assert!(matches!(err, FlightError::OutOfSequence { phase: FlightPhase::Airborne, .. }));
    assert_eq!(sim.count(MavCmd::MAV_CMD_NAV_TAKEOFF), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_takeoff_disarms() {
    let policy = Policy { takeoff: Reply::Ack(MavResult::MAV_RESULT_DENIED), ..Policy::default() };
    let (link, sim) = sim(policy);
    let mut fc = FlightController::new(link, test_config());

    let err = fc.execute(guided_sortie("GUIDED", vec![]), pending()).await.unwrap_err();
    assert!(matches!(err, FlightError::Aborted { reason: AbortReason::TakeoffRejected, during: FlightPhase::Armed }));
    assert!(sim.position(is_disarm).is_some());
    // refused outright, so the vehicle never left the ground
    assert!(sim.position(|c| is_mode(c, RTL)).is_none());
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_takeoff_ack_wait_returns_before_disarm() {
    let policy = Policy { takeoff: Reply::Silent, ..Policy::default() };
    let (link, sim) = sim(policy);
    let mut fc = FlightController::new(link, test_config());

    let err = fc
        .execute(guided_sortie("GUIDED", vec![]), tokio::time::sleep(Duration::from_millis(1500)))
        .await
        .unwrap_err();
    assert!(matches!(err, FlightError::Interrupted));
    assert_eq!(fc.phase(), FlightPhase::Aborted(AbortReason::Interrupted));
    assert_eq!(sim.count(MavCmd::MAV_CMD_NAV_TAKEOFF), 2);

    let takeoff = sim.position(|c| c.command == MavCmd::MAV_CMD_NAV_TAKEOFF).unwrap();
    let rtl = sim.position(|c| is_mode(c, RTL)).unwrap();
    let disarm = sim.position(is_disarm).unwrap();
    assert!(takeoff < rtl && rtl < disarm);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_takeoff_is_treated_as_climbing() {
    let policy = Policy { takeoff: Reply::Silent, ..Policy::default() };
    let (link, sim) = sim(policy);
    let mut fc = FlightController::new(link, test_config());

    let err = fc.execute(guided_sortie("GUIDED", vec![]), pending()).await.unwrap_err();
    assert!(matches!(err, FlightError::Aborted { reason: AbortReason::TakeoffRejected, during: FlightPhase::Armed }));
    assert_eq!(sim.count(MavCmd::MAV_CMD_NAV_TAKEOFF), 3);
    let rtl = sim.position(|c| is_mode(c, RTL)).unwrap();
    let disarm = sim.position(is_disarm).unwrap();
    assert!(rtl < disarm);
}

#[tokio::test(start_paused = true)]
async fn missing_gps_fix_aborts_before_any_command() {
    let (link, sim) = sim(Policy::default());
    let mut cfg = test_config();
    cfg.flight.require_gps_fix = true;
    cfg.timing.gps_fix_timeout_ms = 2000;
    let mut fc = FlightController::new(link, cfg);
    let mut sortie = guided_sortie("GUIDED", vec![]);
    sortie.preflight = true;

    let err = fc.execute(sortie, pending()).await.unwrap_err();
    assert!(matches!(err, FlightError::Aborted { reason: AbortReason::NoGpsFix, during: FlightPhase::Connected }));
    assert!(sim.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn refused_land_falls_back_to_return_mode() {
    let policy = Policy { land: Reply::Ack(MavResult::MAV_RESULT_DENIED), ..Policy::default() };
    let (link, sim) = sim(policy);
    let mut fc = FlightController::new(link, test_config());
    let mut sortie = guided_sortie("GUIDED", vec![MissionStep::Hold { duration_ms: 1000 }]);
    sortie.descent = Descent::Land;

    fc.execute(sortie, pending()).await.unwrap();
    assert_eq!(fc.phase(), FlightPhase::Landed);
    assert_eq!(sim.count(MavCmd::MAV_CMD_NAV_LAND), 1);

    let land = sim.position(|c| c.command == MavCmd::MAV_CMD_NAV_LAND).unwrap();
    let rtl = sim.position(|c| is_mode(c, RTL)).unwrap();
    let disarm = sim.position(is_disarm).unwrap();
    assert!(land < rtl && rtl < disarm);
}

#[tokio::test(start_paused = true)]
async fn interrupt_while_airborne_returns_and_disarms() {
    let (link, sim) = sim(Policy::default());
    let mut fc = FlightController::new(link, test_config()).with_live_source(Arc::new(Fixed(MotionSetpoint::HOLD)));
    let (_done_tx, done_rx) = watch::channel(false);
    let sortie = Sortie {
        mode: "GUIDED".into(),
        preflight: false,
        takeoff: Takeoff::Guided { altitude_m: 5.0 },
        activity: Activity::Live(done_rx),
        descent: Descent::ReturnToLaunch,
    };

    let err = fc.execute(sortie, tokio::time::sleep(Duration::from_secs(10))).await.unwrap_err();
    assert!(matches!(err, FlightError::Interrupted));
    assert_eq!(fc.phase(), FlightPhase::Aborted(AbortReason::Interrupted));

    let takeoff = sim.position(|c| c.command == MavCmd::MAV_CMD_NAV_TAKEOFF).unwrap();
    let rtl = sim.position(|c| is_mode(c, RTL)).unwrap();
    let disarm = sim.position(is_disarm).unwrap();
    assert!(takeoff < rtl && rtl < disarm);
}

#[tokio::test(start_paused = true)]
async fn silent_vehicle_aborts_airborne_flight() {
    let (link, sim) = sim(Policy::default());
    let mut fc = FlightController::new(link, test_config());

    fc.connect().await.unwrap();
    fc.set_mode("GUIDED").await.unwrap();
    fc.arm().await.unwrap();
    fc.take_off(Takeoff::Guided { altitude_m: 10.0 }).await.unwrap();

    sim.mute();
    let err = fc.fly(&[MissionStep::Hold { duration_ms: 60_000 }]).await.unwrap_err();
    assert!(matches!(err, FlightError::Aborted { reason: AbortReason::LinkLost, during: FlightPhase::Airborne }));
    assert!(sim.position(|c| is_mode(c, RTL)).is_some());
    assert!(sim.position(is_disarm).is_some());
}

#[tokio::test(start_paused = true)]
async fn throttle_flight_ramps_up_and_down() {
    let (link, sim) = sim(Policy::default());
    let live = Arc::new(Fixed(MotionSetpoint::throttle_only(1650)));
    let mut fc = FlightController::new(link, test_config()).with_live_source(live);
    let (done_tx, done_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let _ = done_tx.send(true);
    });
    let sortie = Sortie {
        mode: "STABILIZE".into(),
        preflight: false,
        takeoff: Takeoff::Throttle(ThrottleRamp { from: 1400, to: 1700, step: 50, step_ms: 200 }),
        activity: Activity::Live(done_rx),
        descent: Descent::Throttle { to: 1200, step: 50, step_ms: 200 },
    };

    fc.execute(sortie, pending()).await.unwrap();
    assert_eq!(fc.phase(), FlightPhase::Landed);
    assert!(sim.position(|c| is_mode(c, STABILIZE)).is_some());
    assert_eq!(sim.count(MavCmd::MAV_CMD_NAV_TAKEOFF), 0);

    let throttles = sim.throttles();
    assert_eq!(throttles.first(), Some(&1400));
    assert!(throttles.contains(&1650));
    assert!(!throttles.contains(&1700));
    assert_eq!(throttles.last(), Some(&1200));
}

#[tokio::test(start_paused = true)]
async fn interrupted_throttle_flight_ramps_down_instead_of_returning() {
    let (link, sim) = sim(Policy::default());
    let live = Arc::new(Fixed(MotionSetpoint::throttle_only(1650)));
    let mut fc = FlightController::new(link, test_config()).with_live_source(live);
    let (_done_tx, done_rx) = watch::channel(false);
    let sortie = Sortie {
        mode: "STABILIZE".into(),
        preflight: false,
        takeoff: Takeoff::Throttle(ThrottleRamp { from: 1400, to: 1700, step: 50, step_ms: 200 }),
        activity: Activity::Live(done_rx),
        descent: Descent::Throttle { to: 1300, step: 100, step_ms: 200 },
    };

    let err = fc.execute(sortie, tokio::time::sleep(Duration::from_secs(4))).await.unwrap_err();
    assert!(matches!(err, FlightError::Interrupted));
    assert_eq!(fc.phase(), FlightPhase::Aborted(AbortReason::Interrupted));
    assert!(sim.position(|c| is_mode(c, RTL)).is_none());
    assert_eq!(sim.count(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH), 0);
    assert!(sim.position(is_disarm).is_some());

    // the sortie's own descent ramp, from the live throttle down to its floor
    let throttles = sim.throttles();
    let last_live = throttles.iter().rposition(|t| *t == 1650).unwrap();
    let mut descent: Vec<u16> = throttles[last_live + 1..].to_vec();
    descent.dedup();
    assert_eq!(descent, vec![1550, 1450, 1350, 1300]);
}

#[tokio::test(start_paused = true)]
async fn streaming_keeps_cadence_during_ack_wait() {
    let policy = Policy { land: Reply::Silent, ..Policy::default() };
    let (link, sim) = sim(policy);
    let hb = HeartbeatMonitor::start(link.clone(), Duration::from_secs(1));
    hb.await_first_heartbeat(Duration::from_secs(2)).await.unwrap();

    let commands = CommandChannel::new(link.clone());
    let streamer = SetpointStreamer::start(link, Arc::new(SetpointBus::new(None)), 10);
    let outcome = commands.send(&Command::land(), Duration::from_secs(1), 2).await.unwrap();
    let published = streamer.stop().await;

    assert_eq!(outcome, CommandOutcome::TimedOut);
    assert_eq!(sim.count(MavCmd::MAV_CMD_NAV_LAND), 3);
    assert!((29..=31).contains(&published), "published {}", published);

    let times = sim.setpoint_times();
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(90) && gap <= Duration::from_millis(110),
            "setpoint gap {:?}",
            gap
        );
    }
}
