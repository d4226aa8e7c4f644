//! Conversions from the TOML schema (`balancer_config`) to runtime config.
//!
//! `BalanceCfg::try_from(&Config)` runs `Config::validate()` first, so the
//! CLI never hand-maps fields.

use std::time::Duration;

use eyre::WrapErr;

use crate::config::{
    BalanceCfg, CalibrationCfg, EstimatorCfg, LoopCfg, OperatorCfg, SafetyCfg, StageCfg,
    StagesCfg,
};
use crate::error::BalanceError;
use crate::estimator::FusionMode;
use crate::pid::{OutputLimits, PidGains};

// ── Loop ─────────────────────────────────────────────────────────────────────

impl From<&balancer_config::Config> for LoopCfg {
    fn from(c: &balancer_config::Config) -> Self {
        Self {
            rate_hz: c.loop_.rate_hz,
            sustained_overrun_ticks: c.loop_.sustained_overrun_ticks,
            status_interval: Duration::from_millis(c.logging.status_interval_ms),
            timing_interval: Duration::from_millis(c.logging.timing_interval_ms),
        }
    }
}

// ── Estimator ────────────────────────────────────────────────────────────────

impl From<&balancer_config::EstimatorCfg> for FusionMode {
    fn from(c: &balancer_config::EstimatorCfg) -> Self {
        match c.mode {
            balancer_config::EstimatorMode::Direct => FusionMode::Direct,
            balancer_config::EstimatorMode::Complementary => {
                FusionMode::Complementary { alpha: c.alpha }
            }
            balancer_config::EstimatorMode::LowPass => FusionMode::LowPass {
                alpha: c.alpha,
                rate_alpha: c.rate_alpha,
            },
        }
    }
}

// ── Safety ───────────────────────────────────────────────────────────────────

impl From<&balancer_config::SafetyCfg> for SafetyCfg {
    fn from(c: &balancer_config::SafetyCfg) -> Self {
        Self {
            hard_limit: c.hard_limit_deg,
            soft_limit: c.soft_limit_deg,
            grace_period: Duration::from_millis(c.grace_period_ms),
            neutral_angle: c.neutral_angle_deg,
        }
    }
}

// ── Operator ─────────────────────────────────────────────────────────────────

impl From<&balancer_config::OperatorCfg> for OperatorCfg {
    fn from(c: &balancer_config::OperatorCfg) -> Self {
        Self {
            base_velocity: c.base_velocity,
            rotation_rate: c.rotation_rate,
            angle_move: c.angle_move_deg,
            max_target_offset: c.max_target_offset_deg,
            max_gain: c.max_gain,
            command_queue: c.command_queue,
        }
    }
}

// ── Stages ───────────────────────────────────────────────────────────────────

fn stage(name: &str, c: &balancer_config::StageCfg, rate_hz: u32) -> eyre::Result<StageCfg> {
    let limits = OutputLimits::new(c.output_min, c.output_max)
        .map_err(|e| eyre::Report::new(BalanceError::Config(e.to_string())))
        .wrap_err_with(|| format!("stages.{name}"))?;
    let divider = c
        .resolved_divider(rate_hz)
        .wrap_err_with(|| format!("stages.{name}"))?;
    Ok(StageCfg {
        enabled: c.enabled,
        gains: PidGains::new(c.kp, c.ki, c.kd),
        setpoint: c.setpoint,
        limits,
        divider,
    })
}

impl TryFrom<&balancer_config::Config> for BalanceCfg {
    type Error = eyre::Report;

    fn try_from(c: &balancer_config::Config) -> eyre::Result<Self> {
        c.validate()
            .map_err(|e| eyre::Report::new(BalanceError::Config(e.to_string())))?;
        let rate = c.loop_.rate_hz;
        Ok(Self {
            loop_: LoopCfg::from(c),
            estimator: EstimatorCfg {
                mode: FusionMode::from(&c.estimator),
                mounting_offset: c.calibration.mounting_offset_deg,
            },
            safety: SafetyCfg::from(&c.safety),
            stages: StagesCfg {
                velocity: stage("velocity", &c.stages.velocity, rate)?,
                tilt: stage("tilt", &c.stages.tilt, rate)?,
                torque: stage("torque", &c.stages.torque, rate)?,
                yaw: stage("yaw", &c.stages.yaw, rate)?,
            },
            calibration: CalibrationCfg {
                torque_per_current_unit: c.calibration.torque_per_current_unit,
            },
            operator: OperatorCfg::from(&c.operator),
        })
    }
}
