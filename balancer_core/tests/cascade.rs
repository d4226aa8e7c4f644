use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use balancer_core::mocks::{
    ActuatorLog, MockCurrent, MockPosition, MockTilt, RecordingActuator, TiltInput,
};
use balancer_core::{
    BalanceCfg, BalanceError, BalanceLoop, FusionMode, Movement, PidGains, SafetyState,
    SafetyZone, StageId, Transition,
};
use balancer_traits::clock::test_clock::TestClock;
use rstest::rstest;

struct Rig {
    lp: BalanceLoop,
    tilt: Arc<TiltInput>,
    left: Arc<ActuatorLog>,
    right: Arc<ActuatorLog>,
    clock: TestClock,
}

fn base_cfg() -> BalanceCfg {
    let mut cfg = BalanceCfg::default();
    cfg.loop_.rate_hz = 200;
    cfg.estimator.mode = FusionMode::Direct;
    cfg.safety.grace_period = Duration::from_millis(100);
    cfg
}

fn rig(cfg: BalanceCfg) -> Rig {
    let (tilt_dev, tilt) = MockTilt::new();
    let (l, left) = RecordingActuator::new();
    let (r, right) = RecordingActuator::new();
    let clock = TestClock::new();
    let lp = BalanceLoop::builder()
        .with_tilt_sensor(tilt_dev)
        .with_actuators(l, r)
        .with_config(cfg)
        .with_clock(clock.clone())
        .build()
        .expect("build loop");
    Rig {
        lp,
        tilt,
        left,
        right,
        clock,
    }
}

#[test]
fn upright_at_rest_commands_zero() {
    let mut r = rig(base_cfg());
    r.tilt.set_tilt(0.0);
    for _ in 0..10 {
        let rep = r.lp.tick().expect("tick");
        assert_eq!(rep.state, SafetyState::Running);
        assert_eq!(rep.torque, 0.0);
        assert_eq!(rep.command.left, 0.0);
        assert_eq!(rep.command.right, 0.0);
    }
    assert!(r.left.is_started() && r.right.is_started());
}

#[test]
fn ticks_are_paced_to_the_period() {
    let mut r = rig(base_cfg());
    let t0 = r.clock.offset();
    for _ in 0..4 {
        r.lp.tick().expect("tick");
    }
    assert_eq!(r.clock.offset() - t0, Duration::from_millis(20));
    assert_eq!(r.lp.stats().ticks, 4);
    assert_eq!(r.lp.stats().overruns, 0);
}

#[test]
fn forward_lean_drives_wheels_forward() {
    let mut r = rig(base_cfg());
    r.tilt.set_tilt(5.0);
    let rep = r.lp.tick().expect("tick");
    assert!(rep.torque > 0.0, "torque {}", rep.torque);
    assert_eq!(r.left.command(), rep.command.left);
    assert_eq!(r.right.command(), rep.command.right);
}

#[test]
fn hard_limit_trips_after_grace_and_stops_actuators() {
    let mut r = rig(base_cfg());
    r.tilt.set_tilt(70.0);

    let first = r.lp.tick().expect("tick");
    assert_eq!(first.state, SafetyState::Running);
    assert_eq!(first.zone, SafetyZone::Hard);
    assert_eq!(first.target_angle, 0.0);

    let mut tripped_at = None;
    for i in 0..40 {
        let rep = r.lp.tick().expect("tick");
        if rep.transition == Some(Transition::Tripped) {
            tripped_at = Some(i);
            assert_eq!(rep.command.left, 0.0);
            assert_eq!(rep.command.right, 0.0);
            break;
        }
    }
    assert!(tripped_at.is_some(), "never tripped");
    assert_eq!(r.lp.safety_state(), SafetyState::Tripped);
    assert!(!r.left.is_started() && !r.right.is_started());
    assert_eq!(r.left.command(), 0.0);
    assert_eq!(r.left.stops(), 1);

    // Still over the limit: stays tripped, nothing is written.
    let writes = r.left.writes.load(Ordering::Relaxed);
    let rep = r.lp.tick().expect("tick");
    assert_eq!(rep.state, SafetyState::Tripped);
    assert_eq!(r.left.writes.load(Ordering::Relaxed), writes);
    assert_eq!(r.lp.telemetry().state, SafetyState::Tripped);
    assert_eq!(r.lp.telemetry().trips, 1);
}

#[test]
fn recovers_once_back_inside_hard_limit() {
    let mut r = rig(base_cfg());
    r.tilt.set_tilt(70.0);
    for _ in 0..40 {
        r.lp.tick().expect("tick");
    }
    assert_eq!(r.lp.safety_state(), SafetyState::Tripped);
    assert_eq!(r.lp.stage(StageId::Tilt).integral(), 0.0);

    r.tilt.set_tilt(10.0);
    let rep = r.lp.tick().expect("tick");
    assert_eq!(rep.transition, Some(Transition::Recovered));
    assert_eq!(rep.state, SafetyState::Running);
    assert!(r.left.is_started());
    assert_eq!(r.left.starts(), 2);
    assert!(rep.command.left > 0.0);
}

#[test]
fn soft_zone_forces_neutral_target_but_keeps_driving() {
    let mut r = rig(base_cfg());
    let h = r.lp.operator_handle();
    h.set_target_offset(2.0).expect("offset");

    r.tilt.set_tilt(5.0);
    let rep = r.lp.tick().expect("tick");
    assert_eq!(rep.zone, SafetyZone::Safe);
    assert!((rep.target_angle - 2.0).abs() < 1e-6);

    r.tilt.set_tilt(35.0);
    let rep = r.lp.tick().expect("tick");
    assert_eq!(rep.state, SafetyState::Running);
    assert_eq!(rep.zone, SafetyZone::Soft);
    assert_eq!(rep.target_angle, 0.0);
    assert!(rep.command.left > 0.0);
    assert!(r.left.is_started());

    r.tilt.set_tilt(5.0);
    let rep = r.lp.tick().expect("tick");
    assert!((rep.target_angle - 2.0).abs() < 1e-6);
}

#[test]
fn without_velocity_loop_target_is_neutral() {
    let mut cfg = base_cfg();
    cfg.safety.neutral_angle = 1.5;
    let mut r = rig(cfg);
    r.tilt.set_tilt(1.0);
    let rep = r.lp.tick().expect("tick");
    assert_eq!(rep.target_angle, 1.5);
    assert_eq!(r.lp.telemetry().velocity, None);
}

#[test]
fn disabled_velocity_loop_ignores_wheel_feedback() {
    let mut cfg = base_cfg();
    cfg.safety.neutral_angle = 1.5;
    cfg.stages.velocity.enabled = false;
    cfg.stages.velocity.setpoint = 200.0;
    let (tilt_dev, tilt) = MockTilt::new();
    let (l, _) = RecordingActuator::new();
    let (rr, _) = RecordingActuator::new();
    let left_enc = MockPosition::default();
    let right_enc = MockPosition::default();
    left_enc.velocity.store(-350.0, Ordering::Relaxed);
    right_enc.velocity.store(-250.0, Ordering::Relaxed);
    let mut lp = BalanceLoop::builder()
        .with_tilt_sensor(tilt_dev)
        .with_actuators(l, rr)
        .with_position_sources(left_enc.clone(), right_enc.clone())
        .with_config(cfg)
        .with_clock(TestClock::new())
        .build()
        .expect("build");
    tilt.set_tilt(1.0);

    for i in 0..25 {
        left_enc.position.store(i * 40, Ordering::Relaxed);
        right_enc.position.store(i * 40, Ordering::Relaxed);
        let rep = lp.tick().expect("tick");
        assert_eq!(rep.target_angle, 1.5, "tick {i}");
    }
    assert_eq!(lp.telemetry().velocity, None);
    assert_eq!(lp.stage(StageId::Velocity).integral(), 0.0);
}

#[test]
fn velocity_output_feeds_tilt_target_in_the_same_tick() {
    let mut cfg = base_cfg();
    cfg.stages.velocity.enabled = true;
    cfg.stages.velocity.setpoint = 100.0;
    let (tilt_dev, tilt) = MockTilt::new();
    let (l, _) = RecordingActuator::new();
    let (rr, _) = RecordingActuator::new();
    let left_enc = MockPosition::default();
    let right_enc = MockPosition::default();
    let mut lp = BalanceLoop::builder()
        .with_tilt_sensor(tilt_dev)
        .with_actuators(l, rr)
        .with_position_sources(left_enc.clone(), right_enc.clone())
        .with_config(cfg)
        .with_clock(TestClock::new())
        .build()
        .expect("build");
    tilt.set_tilt(0.0);

    let rep = lp.tick().expect("tick");
    // kp 0.002 x error 100
    assert!((rep.target_angle - 0.2).abs() < 1e-6, "{}", rep.target_angle);
    assert_eq!(lp.stage(StageId::Tilt).setpoint(), rep.target_angle);

    // Divider 10: held output until the next evaluation.
    left_enc.velocity.store(100.0, Ordering::Relaxed);
    right_enc.velocity.store(100.0, Ordering::Relaxed);
    let rep = lp.tick().expect("tick");
    assert!((rep.target_angle - 0.2).abs() < 1e-6);
    for _ in 0..8 {
        lp.tick().expect("tick");
    }
    let rep = lp.tick().expect("tick");
    assert!(rep.target_angle.abs() < 1e-6, "{}", rep.target_angle);
    assert_eq!(lp.telemetry().velocity, Some(100.0));
}

#[test]
fn travel_accumulates_mean_wheel_distance() {
    let mut cfg = base_cfg();
    cfg.stages.velocity.enabled = true;
    cfg.stages.velocity.divider = 1;
    let (tilt_dev, _tilt) = MockTilt::new();
    let (l, _) = RecordingActuator::new();
    let (rr, _) = RecordingActuator::new();
    let left_enc = MockPosition::default();
    let right_enc = MockPosition::default();
    let mut lp = BalanceLoop::builder()
        .with_tilt_sensor(tilt_dev)
        .with_actuators(l, rr)
        .with_position_sources(left_enc.clone(), right_enc.clone())
        .with_config(cfg)
        .with_clock(TestClock::new())
        .build()
        .expect("build");
    lp.tick().expect("tick");
    left_enc.position.store(100, Ordering::Relaxed);
    right_enc.position.store(-50, Ordering::Relaxed);
    lp.tick().expect("tick");
    assert_eq!(lp.telemetry().travel, 75.0);
}

#[test]
fn sensor_fault_stops_actuators_and_reports_hardware_fault() {
    let mut r = rig(base_cfg());
    r.tilt.set_tilt(3.0);
    r.lp.tick().expect("tick");
    r.tilt.set_fail(true);
    let err = r.lp.tick().expect_err("fault");
    assert!(matches!(
        err.downcast_ref::<BalanceError>(),
        Some(BalanceError::HardwareFault(_))
    ));
    assert!(format!("{err:#}").contains("reading tilt"));
    assert!(!r.left.is_started() && !r.right.is_started());
    assert_eq!(r.left.command(), 0.0);
    assert_eq!(r.right.command(), 0.0);
}

#[test]
fn actuator_write_fault_stops_both_sides() {
    let mut r = rig(base_cfg());
    r.lp.tick().expect("tick");
    r.right.fail_writes.store(true, Ordering::Relaxed);
    let err = r.lp.tick().expect_err("fault");
    assert!(matches!(
        err.downcast_ref::<BalanceError>(),
        Some(BalanceError::HardwareFault(_))
    ));
    assert!(!r.left.is_started());
    assert!(!r.right.is_started());
}

#[test]
fn startup_fault_leaves_no_actuator_running() {
    let mut r = rig(base_cfg());
    r.right.fail_writes.store(true, Ordering::Relaxed);
    let shutdown = AtomicBool::new(false);

    let err = r
        .lp
        .run(&shutdown, Some(Duration::from_millis(50)))
        .expect_err("startup must fail");
    assert!(matches!(
        err.chain().find_map(|e| e.downcast_ref::<BalanceError>()),
        Some(BalanceError::HardwareFault(_))
    ));
    assert!(!r.left.is_started(), "left actuator still running");
    assert!(!r.right.is_started(), "right actuator still running");
    assert_eq!(r.left.command(), 0.0);
    assert!(r.left.stops() >= 1 && r.right.stops() >= 1);
    assert_eq!(r.lp.stats().ticks, 0);
}

#[test]
fn gains_apply_between_ticks_as_one_unit() {
    let mut r = rig(base_cfg());
    let h = r.lp.operator_handle();
    assert_eq!(h.gains(StageId::Tilt), PidGains::new(0.03, 0.2, 0.01));

    h.set_gains(StageId::Tilt, PidGains::new(0.5, 0.0, 0.0))
        .expect("queue");
    assert_eq!(r.lp.stage(StageId::Tilt).gains(), PidGains::new(0.03, 0.2, 0.01));

    r.tilt.set_tilt(1.0);
    let rep = r.lp.tick().expect("tick");
    assert_eq!(r.lp.stage(StageId::Tilt).gains(), PidGains::new(0.5, 0.0, 0.0));
    assert!((rep.torque - 0.5).abs() < 1e-6);
    assert_eq!(h.gains(StageId::Tilt), PidGains::new(0.5, 0.0, 0.0));
}

#[test]
fn rejected_update_keeps_previous_gains() {
    let mut r = rig(base_cfg());
    let h = r.lp.operator_handle();
    let err = h
        .set_gains(StageId::Tilt, PidGains::new(0.1, f32::NAN, 0.0))
        .expect_err("non-finite");
    assert!(matches!(
        err.downcast_ref::<BalanceError>(),
        Some(BalanceError::InvalidConfigurationUpdate(_))
    ));
    r.lp.tick().expect("tick");
    assert_eq!(r.lp.stage(StageId::Tilt).gains(), PidGains::new(0.03, 0.2, 0.01));
}

#[rstest]
#[case(Movement::Forward, 3.0)]
#[case(Movement::Backward, -3.0)]
fn move_presets_shift_target_without_velocity_loop(#[case] m: Movement, #[case] offset: f32) {
    let mut r = rig(base_cfg());
    let h = r.lp.operator_handle();
    h.movement(m).expect("queue");
    let rep = r.lp.tick().expect("tick");
    assert_eq!(r.lp.target_offset(), offset);
    assert_eq!(rep.target_angle, offset);

    h.movement(Movement::Stop).expect("queue");
    let rep = r.lp.tick().expect("tick");
    assert_eq!(rep.target_angle, 0.0);
}

#[test]
fn rotate_without_yaw_loop_uses_open_loop_differential() {
    let mut r = rig(base_cfg());
    let h = r.lp.operator_handle();
    h.movement(Movement::RotateLeft).expect("queue");
    let rep = r.lp.tick().expect("tick");
    assert!((rep.differential - 0.1).abs() < 1e-6);
    assert!((rep.command.right - rep.command.left - 0.2).abs() < 1e-6);

    h.movement(Movement::RotateRight).expect("queue");
    let rep = r.lp.tick().expect("tick");
    assert!((rep.differential + 0.1).abs() < 1e-6);

    h.movement(Movement::Stop).expect("queue");
    let rep = r.lp.tick().expect("tick");
    assert_eq!(rep.differential, 0.0);
}

#[test]
fn rotate_with_yaw_loop_sets_yaw_rate_setpoint() {
    let mut cfg = base_cfg();
    cfg.stages.yaw.enabled = true;
    cfg.stages.yaw.divider = 1;
    let mut r = rig(cfg);
    let h = r.lp.operator_handle();
    h.movement(Movement::RotateLeft).expect("queue");
    let rep = r.lp.tick().expect("tick");
    assert_eq!(r.lp.stage(StageId::Yaw).setpoint(), 45.0);
    // yaw rate 0 below a positive setpoint: right wheel faster
    assert!(rep.differential > 0.0);

    h.movement(Movement::RotateRight).expect("queue");
    r.lp.tick().expect("tick");
    assert_eq!(r.lp.stage(StageId::Yaw).setpoint(), -45.0);
}

#[test]
fn tilt_setpoint_request_moves_the_target_offset() {
    let mut r = rig(base_cfg());
    let h = r.lp.operator_handle();
    h.set_setpoint(StageId::Tilt, 4.0).expect("queue");
    let rep = r.lp.tick().expect("tick");
    assert_eq!(rep.target_angle, 4.0);
    assert_eq!(h.target_offset(), 4.0);
}

#[test]
fn torque_feedback_corrects_the_demand() {
    let mut cfg = base_cfg();
    cfg.stages.torque.enabled = true;
    let (tilt_dev, tilt) = MockTilt::new();
    let (l, _) = RecordingActuator::new();
    let (rr, _) = RecordingActuator::new();
    let current = MockCurrent::default();
    let mut lp = BalanceLoop::builder()
        .with_tilt_sensor(tilt_dev)
        .with_actuators(l, rr)
        .with_current_sources(current.clone(), current)
        .with_config(cfg)
        .with_clock(TestClock::new())
        .build()
        .expect("build");
    tilt.set_tilt(5.0);
    let rep = lp.tick().expect("tick");
    let demand = lp.stage(StageId::Tilt).last_output();
    assert!(demand > 0.0);
    // no measured current: correction = kp 0.5 x demand
    assert!((rep.torque - 1.5 * demand).abs() < 1e-5, "{} vs {}", rep.torque, demand);
    assert_eq!(lp.stage(StageId::Torque).setpoint(), demand);
}

#[test]
fn run_honours_max_duration_and_stops_actuators() {
    let mut r = rig(base_cfg());
    let shutdown = AtomicBool::new(false);
    let stats = r
        .lp
        .run(&shutdown, Some(Duration::from_millis(100)))
        .expect("run");
    assert_eq!(stats.ticks, 20);
    assert!(!r.left.is_started() && !r.right.is_started());
}

#[test]
fn run_returns_immediately_when_shutdown_is_set() {
    let mut r = rig(base_cfg());
    let shutdown = AtomicBool::new(true);
    let stats = r.lp.run(&shutdown, None).expect("run");
    assert_eq!(stats.ticks, 0);
    assert_eq!(r.left.stops(), 1);
}

#[test]
fn telemetry_tracks_the_latest_tick() {
    let mut r = rig(base_cfg());
    let h = r.lp.operator_handle();
    r.tilt.set_tilt(2.0);
    for _ in 0..3 {
        r.lp.tick().expect("tick");
    }
    let t = h.telemetry();
    assert_eq!(t.tick, 3);
    assert_eq!(t.raw_angle, 2.0);
    assert_eq!(t.filtered_angle, 2.0);
    assert_eq!(t.command, r.lp.telemetry().command);
    assert!(t.stage(StageId::Tilt).enabled);
    assert!(!t.stage(StageId::Yaw).enabled);
    assert_eq!(t.uptime_us, 10_000);
}
