use assert_cmd::Command;
use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

const VALID: &str = r#"
[loop]
rate_hz = 200

[safety]
hard_limit_deg = 60.0
soft_limit_deg = 30.0
grace_period_ms = 500

[stages.tilt]
kp = 0.03
ki = 0.2
kd = 0.01

[stages.yaw]
enabled = true
kp = 0.002
ki = 0.0
kd = 0.0
output_min = -0.1
output_max = 0.1
interval_s = 0.025

[backend]
kind = "sim"
"#;

fn write_config(dir: &tempfile::TempDir, toml: &str) -> PathBuf {
    let path = dir.path().join("balancer.toml");
    fs::write(&path, toml).unwrap();
    path
}

fn balancer(cfg: &PathBuf) -> Command {
    let mut cmd = Command::cargo_bin("balancer").unwrap();
    cmd.arg("--config").arg(cfg).arg("--log-level").arg("warn");
    cmd
}

#[rstest]
#[case(&["--help"], 0, "Usage:", "stdout")]
#[case(&["check-config"], 0, "config OK: 200 Hz", "stdout")]
#[case(&["self-check"], 0, "self-check OK", "stdout")]
#[case(&["run", "--duration-ms", "300"], 0, "run complete", "stdout")]
#[case(&["run", "--duration-ms", "200", "--stats"], 0, "Balancer Stats", "stderr")]
#[case(&["run", "--rt-lock", "bogus"], 2, "invalid value", "stderr")]
#[case(&["--backend", "hardware", "self-check"], 3, "What happened", "stderr")]
fn cli_table_cases(
    #[case] args: &[&str],
    #[case] exit_code: i32,
    #[case] needle: &str,
    #[case] stream: &str,
) {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, VALID);

    let mut cmd = balancer(&cfg);
    cmd.args(args);
    let assert = cmd.assert().code(exit_code);

    match stream {
        "stdout" => {
            assert.stdout(predicate::str::contains(needle));
        }
        "stderr" => {
            assert.stderr(predicate::str::contains(needle));
        }
        other => panic!("unknown stream: {other}"),
    }
}

#[test]
fn check_config_lists_stage_dividers() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, VALID);
    balancer(&cfg)
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("yaw       enabled  every 5 tick(s)"))
        .stdout(predicate::str::contains("velocity  disabled"));
}

#[rstest]
#[case::inverted_limits("[loop]\nrate_hz = 200\n[safety]\nsoft_limit_deg = 70.0\n", "soft_limit_deg")]
#[case::missing_loop("[safety]\nsoft_limit_deg = 20.0\n", "loop")]
#[case::decimated_inner(
    "[loop]\nrate_hz = 200\n[stages.tilt]\nkp = 1.0\nki = 0.0\nkd = 0.0\ndivider = 2\n",
    "innermost"
)]
#[case::ragged_interval(
    "[loop]\nrate_hz = 200\n[stages.yaw]\nkp = 1.0\nki = 0.0\nkd = 0.0\ninterval_s = 0.0123\n",
    "whole number of ticks"
)]
fn invalid_config_exits_with_config_code(#[case] toml: &str, #[case] needle: &str) {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, toml);
    balancer(&cfg)
        .arg("check-config")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Configuration is invalid"))
        .stderr(predicate::str::contains(needle));
}

#[test]
fn missing_config_file_is_a_config_error() {
    let dir = tempdir().unwrap();
    let cfg = dir.path().join("nope.toml");
    balancer(&cfg)
        .arg("run")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn console_reads_operator_commands_from_stdin() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, VALID);
    balancer(&cfg)
        .args(["run", "--duration-ms", "400", "--console"])
        .write_stdin("gains tilt 0.04 0.2 0.01\noffset 99\nmove stop\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("tilt gains queued"))
        .stdout(predicate::str::contains("rejected"))
        .stdout(predicate::str::contains("movement queued: Stop"));
}
