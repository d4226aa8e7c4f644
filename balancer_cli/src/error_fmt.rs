//! Human-readable error descriptions, structured JSON errors and exit codes.

use balancer_core::{BalanceError, BuildError};

/// Exit code for a hardware fault (sensor, actuator, backend init).
pub const EXIT_HARDWARE: i32 = 3;
/// Exit code for a missing, unreadable or invalid config.
pub const EXIT_CONFIG: i32 = 4;

fn balance_error(err: &eyre::Report) -> Option<&BalanceError> {
    err.chain().find_map(|e| e.downcast_ref::<BalanceError>())
}

fn build_error(err: &eyre::Report) -> Option<&BuildError> {
    err.chain().find_map(|e| e.downcast_ref::<BuildError>())
}

/// Outermost context message, e.g. "read tilt" or "assembling control loop".
fn context(err: &eyre::Report) -> String {
    err.to_string()
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(be) = build_error(err) {
        return match be {
            BuildError::MissingTiltSensor | BuildError::MissingActuators => format!(
                "What happened: The control loop was assembled without a required device ({be}).\nLikely causes: The backend failed to open the IMU or a motor driver.\nHow to fix: Run `balancer self-check` to see which device does not respond."
            ),
            BuildError::MissingPositionSources => "What happened: The velocity loop is enabled but no wheel encoders are available.\nLikely causes: Encoders not wired or not configured for this backend.\nHow to fix: Wire the encoders or set stages.velocity.enabled = false.".to_string(),
            BuildError::MissingCurrentSources => "What happened: Torque feedback is enabled but no current sensors are available.\nLikely causes: Current ADCs missing for this backend.\nHow to fix: Fit the current sensors or set stages.torque.enabled = false.".to_string(),
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Out-of-range values in the TOML.\nHow to fix: Edit the config file, then run `balancer check-config`."
            ),
        };
    }

    if let Some(be) = balance_error(err) {
        return match be {
            BalanceError::HardwareFault(msg) => format!(
                "What happened: A sensor or motor driver failed ({ctx}: {msg}). Both motors were told to stop.\nLikely causes: Loose I2C/GPIO wiring, missing power to the IMU or drivers, or insufficient GPIO permissions.\nHow to fix: Check wiring and power, run `balancer self-check`, then start again.",
                ctx = context(err)
            ),
            BalanceError::Config(msg) => format!(
                "What happened: Configuration is invalid ({msg}).\nLikely causes: Missing [loop] section, a typo in a key, or out-of-range values.\nHow to fix: Edit the TOML config and validate it with `balancer check-config`."
            ),
            BalanceError::InvalidConfigurationUpdate(msg) => format!(
                "What happened: An operator update was rejected ({msg}).\nLikely causes: Non-finite value or a value outside the operator bounds.\nHow to fix: Stay within [operator] max_gain / max_target_offset_deg."
            ),
            BalanceError::State(msg) => format!(
                "What happened: {msg}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug for more detail."
            ),
            BalanceError::Disconnected => "What happened: The control loop is no longer running.\nLikely causes: It stopped after an error or shutdown.\nHow to fix: Check the log for the error that ended the run.".to_string(),
        };
    }

    // Generic fallback
    let msg = err.to_string();
    let mut cause = String::new();
    if let Some(src) = err.chain().nth(1) {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes: hardware 3, configuration 4, anything else 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    match (balance_error(err), build_error(err)) {
        (Some(BalanceError::HardwareFault(_)), _) => EXIT_HARDWARE,
        (_, Some(BuildError::MissingTiltSensor | BuildError::MissingActuators)) => EXIT_HARDWARE,
        (Some(BalanceError::Config(_)), _) | (_, Some(_)) => EXIT_CONFIG,
        _ => 1,
    }
}

/// Short stable name for the error class, used as `reason` in JSON.
pub fn reason_name(err: &eyre::Report) -> &'static str {
    if build_error(err).is_some() {
        return "Build";
    }
    match balance_error(err) {
        Some(BalanceError::HardwareFault(_)) => "HardwareFault",
        Some(BalanceError::Config(_)) => "Config",
        Some(BalanceError::InvalidConfigurationUpdate(_)) => "InvalidConfigurationUpdate",
        Some(BalanceError::State(_)) => "State",
        Some(BalanceError::Disconnected) => "Disconnected",
        None => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    serde_json::json!({
        "reason": reason_name(err),
        "exit_code": exit_code_for_error(err),
        "message": humanize(err),
    })
    .to_string()
}
