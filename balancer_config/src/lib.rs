#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
//! Config schema for the balance controller.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Everything but `[loop]` has defaults; a stage table that is present
//!   must carry its own gains.
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct LoopCfg {
    /// Tick rate of the fastest (innermost) loop.
    pub rate_hz: u32,
    /// Worst observed tilt read latency; enables the period/latency check.
    #[serde(default)]
    pub expected_sensor_latency_us: Option<u64>,
    /// Required ratio of tick period to sensor latency.
    #[serde(default = "default_latency_margin")]
    pub latency_margin: f32,
    /// Consecutive overruns before the loop flags a sustained overrun.
    #[serde(default = "default_sustained_overrun_ticks")]
    pub sustained_overrun_ticks: u32,
}

fn default_latency_margin() -> f32 {
    5.0
}

fn default_sustained_overrun_ticks() -> u32 {
    50
}

impl LoopCfg {
    /// Tick period in seconds.
    pub fn period_s(&self) -> f32 {
        1.0 / self.rate_hz as f32
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorMode {
    Direct,
    #[default]
    Complementary,
    LowPass,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EstimatorCfg {
    pub mode: EstimatorMode,
    /// Weight kept on the previous estimate: the rate-integrated prediction
    /// in complementary mode, the previous tilt in low-pass mode. Range (0, 1).
    pub alpha: f32,
    /// Weight kept on the previous rate in low-pass mode. Range [0, 1).
    pub rate_alpha: f32,
}

impl Default for EstimatorCfg {
    fn default() -> Self {
        Self {
            mode: EstimatorMode::Complementary,
            alpha: 0.98,
            rate_alpha: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CalibrationCfg {
    /// Added to every raw tilt sample so that upright reads 0.
    pub mounting_offset_deg: f32,
    /// Torque units per raw current unit (torque feedback stage).
    pub torque_per_current_unit: f32,
}

impl Default for CalibrationCfg {
    fn default() -> Self {
        Self {
            mounting_offset_deg: 0.0,
            torque_per_current_unit: 0.0025,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SafetyCfg {
    pub hard_limit_deg: f32,
    pub soft_limit_deg: f32,
    /// Hard-limit trips are suppressed this long after start and after each trip.
    pub grace_period_ms: u64,
    /// Tilt target forced while in the soft zone.
    pub neutral_angle_deg: f32,
}

impl Default for SafetyCfg {
    fn default() -> Self {
        Self {
            hard_limit_deg: 60.0,
            soft_limit_deg: 30.0,
            grace_period_ms: 1000,
            neutral_angle_deg: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct StageCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    #[serde(default)]
    pub setpoint: f32,
    #[serde(default = "default_output_min")]
    pub output_min: f32,
    #[serde(default = "default_output_max")]
    pub output_max: f32,
    /// Run every N ticks. Mutually exclusive with `interval_s`.
    #[serde(default)]
    pub divider: Option<u32>,
    /// Run every `interval_s` seconds; must be a whole number of ticks.
    #[serde(default)]
    pub interval_s: Option<f32>,
}

fn default_true() -> bool {
    true
}

fn default_output_min() -> f32 {
    -1.0
}

fn default_output_max() -> f32 {
    1.0
}

impl StageCfg {
    fn disabled(kp: f32, ki: f32, kd: f32, limit: f32, divider: u32) -> Self {
        Self {
            enabled: false,
            kp,
            ki,
            kd,
            setpoint: 0.0,
            output_min: -limit,
            output_max: limit,
            divider: Some(divider),
            interval_s: None,
        }
    }

    /// Resolve `divider`/`interval_s` into a tick divider at `rate_hz`.
    pub fn resolved_divider(&self, rate_hz: u32) -> eyre::Result<u32> {
        match (self.divider, self.interval_s) {
            (Some(_), Some(_)) => eyre::bail!("set either divider or interval_s, not both"),
            (Some(0), None) => eyre::bail!("divider must be >= 1"),
            (Some(d), None) => Ok(d),
            (None, None) => Ok(1),
            (None, Some(s)) => {
                if !(s.is_finite() && s > 0.0) {
                    eyre::bail!("interval_s must be finite and > 0");
                }
                let ticks = f64::from(s) * f64::from(rate_hz);
                let rounded = ticks.round();
                if rounded < 1.0 || (ticks - rounded).abs() > 1e-3 {
                    eyre::bail!(
                        "interval_s = {s} is not a whole number of ticks at {rate_hz} Hz ({ticks:.3})"
                    );
                }
                Ok(rounded as u32)
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Stages {
    /// Wheel velocity -> tilt target offset.
    #[serde(default = "default_velocity_stage")]
    pub velocity: StageCfg,
    /// Tilt -> torque.
    #[serde(default = "default_tilt_stage")]
    pub tilt: StageCfg,
    /// Measured torque (current) correction.
    #[serde(default = "default_torque_stage")]
    pub torque: StageCfg,
    /// Yaw rate -> torque differential.
    #[serde(default = "default_yaw_stage")]
    pub yaw: StageCfg,
}

impl Default for Stages {
    fn default() -> Self {
        Self {
            velocity: default_velocity_stage(),
            tilt: default_tilt_stage(),
            torque: default_torque_stage(),
            yaw: default_yaw_stage(),
        }
    }
}

fn default_velocity_stage() -> StageCfg {
    StageCfg::disabled(0.002, 0.0, 0.0, 5.0, 10)
}

fn default_tilt_stage() -> StageCfg {
    let mut s = StageCfg::disabled(0.03, 0.2, 0.01, 1.0, 1);
    s.enabled = true;
    s
}

fn default_torque_stage() -> StageCfg {
    StageCfg::disabled(0.5, 0.0, 0.0, 0.5, 1)
}

fn default_yaw_stage() -> StageCfg {
    StageCfg::disabled(0.002, 0.0, 0.0, 0.1, 5)
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OperatorCfg {
    /// Velocity setpoint (ticks/s) for the forward/backward presets.
    pub base_velocity: f32,
    /// Yaw rate setpoint (deg/s) for the rotate presets.
    pub rotation_rate: f32,
    /// Tilt offset used by forward/backward when the velocity loop is off.
    pub angle_move_deg: f32,
    pub max_target_offset_deg: f32,
    /// Upper bound accepted for any operator-submitted gain.
    pub max_gain: f32,
    /// Capacity of the operator command queue.
    pub command_queue: usize,
}

impl Default for OperatorCfg {
    fn default() -> Self {
        Self {
            base_velocity: 500.0,
            rotation_rate: 45.0,
            angle_move_deg: 3.0,
            max_target_offset_deg: 10.0,
            max_gain: 1000.0,
            command_queue: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
    /// Period of the debug status line (0 disables).
    pub status_interval_ms: u64,
    /// Period of the timing summary (0 disables).
    pub timing_interval_ms: u64,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            file: None,
            level: None,
            rotation: None,
            status_interval_ms: 250,
            timing_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SidePins {
    pub pwm_channel: u8,
    pub dir_pin: u8,
    pub enable_pin: u8,
    pub encoder_a: u8,
    pub encoder_b: u8,
    pub current_adc_address: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Hardware {
    pub i2c_bus: u8,
    pub imu_address: u16,
    /// Max time to wait for the IMU to acknowledge a mode switch.
    pub imu_init_timeout_ms: u64,
    pub pwm_frequency_hz: f64,
    pub left: SidePins,
    pub right: SidePins,
}

impl Default for Hardware {
    fn default() -> Self {
        Self {
            i2c_bus: 1,
            imu_address: 0x28,
            imu_init_timeout_ms: 100,
            pwm_frequency_hz: 50_000.0,
            left: SidePins {
                pwm_channel: 1,
                dir_pin: 23,
                enable_pin: 17,
                encoder_a: 19,
                encoder_b: 20,
                current_adc_address: 0x4B,
            },
            right: SidePins {
                pwm_channel: 0,
                dir_pin: 24,
                enable_pin: 18,
                encoder_a: 9,
                encoder_b: 10,
                current_adc_address: 0x4D,
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sim,
    Hardware,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Backend {
    pub kind: BackendKind,
    /// Simulated IMU read latency.
    pub sim_read_latency_us: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(rename = "loop")]
    pub loop_: LoopCfg,
    #[serde(default)]
    pub estimator: EstimatorCfg,
    #[serde(default)]
    pub calibration: CalibrationCfg,
    #[serde(default)]
    pub safety: SafetyCfg,
    #[serde(default)]
    pub stages: Stages,
    #[serde(default)]
    pub operator: OperatorCfg,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub hardware: Hardware,
    #[serde(default)]
    pub backend: Backend,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

fn finite(v: f32) -> bool {
    v.is_finite()
}

fn validate_stage(name: &str, s: &StageCfg, rate_hz: u32) -> eyre::Result<u32> {
    for (field, v) in [("kp", s.kp), ("ki", s.ki), ("kd", s.kd)] {
        if !finite(v) || v < 0.0 {
            eyre::bail!("stages.{name}.{field} must be finite and >= 0");
        }
    }
    if !finite(s.setpoint) {
        eyre::bail!("stages.{name}.setpoint must be finite");
    }
    if !(finite(s.output_min) && finite(s.output_max)) || s.output_min >= s.output_max {
        eyre::bail!("stages.{name}: output_min must be < output_max");
    }
    s.resolved_divider(rate_hz)
        .map_err(|e| eyre::eyre!("stages.{name}: {e}"))
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Loop
        let rate = self.loop_.rate_hz;
        if rate == 0 {
            eyre::bail!("loop.rate_hz must be > 0");
        }
        if rate > 20_000 {
            eyre::bail!("loop.rate_hz is unreasonably large (>20 kHz)");
        }
        if !(finite(self.loop_.latency_margin) && self.loop_.latency_margin >= 1.0) {
            eyre::bail!("loop.latency_margin must be >= 1.0");
        }
        if self.loop_.sustained_overrun_ticks == 0 {
            eyre::bail!("loop.sustained_overrun_ticks must be >= 1");
        }
        if let Some(lat_us) = self.loop_.expected_sensor_latency_us {
            let period_us = 1e6 / f64::from(rate);
            let needed_us = f64::from(self.loop_.latency_margin) * lat_us as f64;
            if period_us < needed_us {
                eyre::bail!(
                    "loop period {period_us:.0} us is shorter than latency_margin x expected_sensor_latency_us ({needed_us:.0} us); lower loop.rate_hz"
                );
            }
        }

        // Estimator
        let alpha = self.estimator.alpha;
        if !(alpha > 0.0 && alpha < 1.0) {
            eyre::bail!("estimator.alpha must be in (0.0, 1.0)");
        }
        let rate_alpha = self.estimator.rate_alpha;
        if !(rate_alpha >= 0.0 && rate_alpha < 1.0) {
            eyre::bail!("estimator.rate_alpha must be in [0.0, 1.0)");
        }

        // Calibration
        if !finite(self.calibration.mounting_offset_deg) {
            eyre::bail!("calibration.mounting_offset_deg must be finite");
        }
        if !finite(self.calibration.torque_per_current_unit) {
            eyre::bail!("calibration.torque_per_current_unit must be finite");
        }

        // Safety
        let s = &self.safety;
        if !(finite(s.soft_limit_deg) && finite(s.hard_limit_deg)) {
            eyre::bail!("safety limits must be finite");
        }
        if !(s.soft_limit_deg > 0.0 && s.soft_limit_deg < s.hard_limit_deg) {
            eyre::bail!("safety limits must satisfy 0 < soft_limit_deg < hard_limit_deg");
        }
        if s.hard_limit_deg > 90.0 {
            eyre::bail!("safety.hard_limit_deg must be <= 90");
        }
        if !finite(s.neutral_angle_deg) || s.neutral_angle_deg.abs() >= s.soft_limit_deg {
            eyre::bail!("safety.neutral_angle_deg must be finite and inside the soft limit");
        }
        if s.grace_period_ms > 60 * 1000 {
            eyre::bail!("safety.grace_period_ms is unreasonably large (>60s)");
        }

        // Stages
        let st = &self.stages;
        let _ = validate_stage("velocity", &st.velocity, rate)?;
        let tilt_div = validate_stage("tilt", &st.tilt, rate)?;
        let torque_div = validate_stage("torque", &st.torque, rate)?;
        let _ = validate_stage("yaw", &st.yaw, rate)?;
        if !st.tilt.enabled {
            eyre::bail!("stages.tilt cannot be disabled");
        }
        let (inner_name, inner_div) = if st.torque.enabled {
            ("torque", torque_div)
        } else {
            ("tilt", tilt_div)
        };
        if inner_div != 1 {
            eyre::bail!("stages.{inner_name} is the innermost stage and must run every tick (divider = 1)");
        }
        if st.torque.enabled && self.calibration.torque_per_current_unit == 0.0 {
            eyre::bail!("calibration.torque_per_current_unit must be non-zero with torque feedback");
        }

        // Operator
        let op = &self.operator;
        for (field, v) in [
            ("base_velocity", op.base_velocity),
            ("rotation_rate", op.rotation_rate),
            ("angle_move_deg", op.angle_move_deg),
            ("max_target_offset_deg", op.max_target_offset_deg),
        ] {
            if !finite(v) || v < 0.0 {
                eyre::bail!("operator.{field} must be finite and >= 0");
            }
        }
        if op.angle_move_deg > op.max_target_offset_deg {
            eyre::bail!("operator.angle_move_deg must be <= operator.max_target_offset_deg");
        }
        if !(finite(op.max_gain) && op.max_gain > 0.0) {
            eyre::bail!("operator.max_gain must be > 0");
        }
        if op.command_queue == 0 {
            eyre::bail!("operator.command_queue must be >= 1");
        }

        // Hardware
        if self.hardware.imu_init_timeout_ms == 0 {
            eyre::bail!("hardware.imu_init_timeout_ms must be >= 1");
        }
        for (name, side) in [("left", &self.hardware.left), ("right", &self.hardware.right)] {
            if side.pwm_channel > 1 {
                eyre::bail!("hardware.{name}.pwm_channel must be 0 or 1");
            }
        }
        if !(self.hardware.pwm_frequency_hz.is_finite() && self.hardware.pwm_frequency_hz > 0.0) {
            eyre::bail!("hardware.pwm_frequency_hz must be > 0");
        }

        // Logging: rotation is parsed by the binary; intervals may be 0 (disabled)

        Ok(())
    }
}
