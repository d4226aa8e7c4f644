use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::process::Command;
use tempfile::tempdir;

#[rstest]
#[case::run(&["run", "--duration-ms", "500"])]
#[case::self_check(&["self-check"])]
fn imu_failure_bubbles_to_cli(#[case] args: &[&str]) {
    let dir = tempdir().unwrap();
    let cfg = dir.path().join("cfg.toml");
    fs::write(&cfg, "[loop]\nrate_hz = 100\n").unwrap();

    let mut cmd = Command::cargo_bin("balancer").unwrap();
    cmd.env("BALANCER_TEST_SIM_FAULT", "imu");
    cmd.arg("--config").arg(&cfg).args(args);
    cmd.assert()
        .code(3)
        .stderr(predicate::str::contains(
            "What happened: A sensor or motor driver failed",
        ))
        .stderr(predicate::str::contains("simulated imu read failure"));
}
