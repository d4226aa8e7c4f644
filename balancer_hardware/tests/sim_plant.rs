use std::time::Duration;

use balancer_hardware::{HwError, Side, SimulatedPlant};
use balancer_traits::clock::test_clock::TestClock;
use balancer_traits::{Actuator, CurrentSource, PositionSource, TiltSensor};

fn started(plant: &SimulatedPlant<TestClock>) -> (impl Actuator, impl Actuator) {
    let mut l = plant.motor(Side::Left);
    let mut r = plant.motor(Side::Right);
    l.start().unwrap();
    r.start().unwrap();
    (l, r)
}

#[test]
fn differential_command_turns_right_positive() {
    let clock = TestClock::new();
    let plant = SimulatedPlant::new(clock.clone());
    plant.hold_pitch(Some(0.0)).unwrap();
    let (mut l, mut r) = started(&plant);
    l.set_command(-0.2).unwrap();
    r.set_command(0.2).unwrap();
    clock.advance(Duration::from_millis(200));

    let mut imu = plant.imu();
    assert!(imu.read_angular_rate_yaw().unwrap() > 0.0);
    assert_eq!(imu.read_tilt().unwrap(), 0.0);
}

#[test]
fn encoders_integrate_and_reset() {
    let clock = TestClock::new();
    let plant = SimulatedPlant::new(clock.clone());
    plant.hold_pitch(Some(0.0)).unwrap();
    let (mut l, mut r) = started(&plant);
    l.set_command(0.5).unwrap();
    r.set_command(0.5).unwrap();
    clock.advance(Duration::from_secs(1));

    let per_s = plant.params().ticks_per_command_s;
    let mut enc = plant.encoder(Side::Right);
    let pos = enc.position().unwrap();
    assert!((pos as f32 - 0.5 * per_s).abs() <= 1.0, "pos {pos}");
    assert_eq!(enc.velocity().unwrap(), 0.5 * per_s);

    enc.reset().unwrap();
    assert_eq!(enc.position().unwrap(), 0);
    let snap = plant.snapshot().unwrap();
    assert!(snap.travel[1] > 0.0);
}

#[test]
fn current_follows_command_sign() {
    let clock = TestClock::new();
    let plant = SimulatedPlant::new(clock.clone());
    let (mut l, _r) = started(&plant);
    l.set_command(-0.25).unwrap();
    let mut cs = plant.current_sensor(Side::Left);
    assert_eq!(cs.read_current().unwrap(), -100);

    l.stop().unwrap();
    assert_eq!(cs.read_current().unwrap(), 0);
}

#[test]
fn injected_imu_fault_surfaces_as_hw_error() {
    let clock = TestClock::new();
    let plant = SimulatedPlant::new(clock);
    plant.fail_imu(true).unwrap();
    let err = plant.imu().read_tilt().expect_err("fault");
    let hw = err.downcast_ref::<HwError>().expect("typed hw error");
    assert!(matches!(hw, HwError::I2c(_)));
}

#[test]
fn non_finite_command_rejected() {
    let clock = TestClock::new();
    let plant = SimulatedPlant::new(clock);
    let (mut l, _r) = started(&plant);
    assert!(l.set_command(f32::NAN).is_err());
    assert_eq!(plant.snapshot().unwrap().commands, [0.0, 0.0]);
}
