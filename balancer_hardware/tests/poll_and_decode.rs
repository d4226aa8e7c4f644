use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

use balancer_hardware::error::HwError;
use balancer_hardware::util::{decode_adc10, decode_sixteenths, poll_until};
use rstest::rstest;

#[test]
fn poll_until_success_path() {
    let ready = Arc::new(AtomicBool::new(false));
    let ready_bg = ready.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(3));
        ready_bg.store(true, Ordering::Relaxed);
    });

    let res = poll_until(
        || Ok(ready.load(Ordering::Relaxed)),
        Duration::from_millis(500),
        Duration::from_micros(200),
    );
    assert!(res.is_ok(), "expected success, got {res:?}");
}

#[test]
fn poll_until_timeout_path() {
    let err = poll_until(
        || Ok(false),
        Duration::from_millis(5),
        Duration::from_micros(200),
    )
    .expect_err("expected timeout error");

    match err {
        HwError::Timeout => {}
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn poll_until_propagates_probe_error() {
    let err = poll_until(
        || Err(HwError::I2c("nack".into())),
        Duration::from_millis(50),
        Duration::from_micros(200),
    )
    .expect_err("probe error");
    assert!(matches!(err, HwError::I2c(_)));
}

#[rstest]
#[case([0x00, 0x00], 0.0)]
#[case([0x10, 0x00], 1.0)]
#[case([0xF0, 0xFF], -1.0)]
#[case([0x68, 0x01], 22.5)]
fn sixteenths_decode(#[case] bytes: [u8; 2], #[case] expected: f32) {
    assert_eq!(decode_sixteenths(bytes), expected);
}

#[rstest]
#[case([0x00, 0x00], 0)]
#[case([0x00, 0x04], 1)]
#[case([0x07, 0xFC], 511)]
#[case([0x08, 0x00], -512)]
#[case([0x0F, 0xFC], -1)]
fn adc10_decode(#[case] bytes: [u8; 2], #[case] expected: i32) {
    assert_eq!(decode_adc10(bytes), expected);
}
