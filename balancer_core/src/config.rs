//! Runtime configuration used by `BalanceLoop`.
//!
//! Separate from the TOML schema in `balancer_config`; `conversions` maps one
//! onto the other. Values here are already validated and unit-converted
//! (durations, output limits, fusion mode).

use std::time::Duration;

use crate::estimator::FusionMode;
use crate::operator::StageId;
use crate::pid::{OutputLimits, PidGains};

#[derive(Debug, Clone)]
pub struct LoopCfg {
    /// Innermost tick rate.
    pub rate_hz: u32,
    /// Consecutive overruns before a sustained-overrun warning.
    pub sustained_overrun_ticks: u32,
    /// Debug status line period; zero disables it.
    pub status_interval: Duration,
    /// Timing summary period; zero disables it.
    pub timing_interval: Duration,
}

impl Default for LoopCfg {
    fn default() -> Self {
        Self {
            rate_hz: 200,
            sustained_overrun_ticks: 50,
            status_interval: Duration::from_millis(250),
            timing_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EstimatorCfg {
    pub mode: FusionMode,
    /// Degrees added to every raw tilt sample.
    pub mounting_offset: f32,
}

impl Default for EstimatorCfg {
    fn default() -> Self {
        Self {
            mode: FusionMode::Complementary { alpha: 0.98 },
            mounting_offset: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyCfg {
    pub hard_limit: f32,
    pub soft_limit: f32,
    pub grace_period: Duration,
    pub neutral_angle: f32,
}

impl Default for SafetyCfg {
    fn default() -> Self {
        Self {
            hard_limit: 60.0,
            soft_limit: 30.0,
            grace_period: Duration::from_secs(1),
            neutral_angle: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageCfg {
    pub enabled: bool,
    pub gains: PidGains,
    pub setpoint: f32,
    pub limits: OutputLimits,
    /// Run every `divider` innermost ticks.
    pub divider: u32,
}

impl StageCfg {
    fn preset(enabled: bool, gains: PidGains, limit: f32, divider: u32) -> Self {
        Self {
            enabled,
            gains,
            setpoint: 0.0,
            limits: OutputLimits::symmetric(limit).unwrap_or(OutputLimits::UNIT),
            divider,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagesCfg {
    pub velocity: StageCfg,
    pub tilt: StageCfg,
    pub torque: StageCfg,
    pub yaw: StageCfg,
}

impl StagesCfg {
    pub fn get(&self, id: StageId) -> &StageCfg {
        match id {
            StageId::Velocity => &self.velocity,
            StageId::Tilt => &self.tilt,
            StageId::Torque => &self.torque,
            StageId::Yaw => &self.yaw,
        }
    }

    pub fn get_mut(&mut self, id: StageId) -> &mut StageCfg {
        match id {
            StageId::Velocity => &mut self.velocity,
            StageId::Tilt => &mut self.tilt,
            StageId::Torque => &mut self.torque,
            StageId::Yaw => &mut self.yaw,
        }
    }

    pub fn dividers(&self) -> [u32; StageId::COUNT] {
        StageId::ALL.map(|id| self.get(id).divider)
    }

    /// The stage that feeds the mixer and must run every tick.
    pub fn innermost(&self) -> StageId {
        if self.torque.enabled {
            StageId::Torque
        } else {
            StageId::Tilt
        }
    }
}

impl Default for StagesCfg {
    fn default() -> Self {
        Self {
            velocity: StageCfg::preset(false, PidGains::new(0.002, 0.0, 0.0), 5.0, 10),
            tilt: StageCfg::preset(true, PidGains::new(0.03, 0.2, 0.01), 1.0, 1),
            torque: StageCfg::preset(false, PidGains::new(0.5, 0.0, 0.0), 0.5, 1),
            yaw: StageCfg::preset(false, PidGains::new(0.002, 0.0, 0.0), 0.1, 5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationCfg {
    /// Converts mean measured current into torque units.
    pub torque_per_current_unit: f32,
}

impl Default for CalibrationCfg {
    fn default() -> Self {
        Self {
            torque_per_current_unit: 0.0025,
        }
    }
}

/// Operator presets and update bounds.
#[derive(Debug, Clone)]
pub struct OperatorCfg {
    pub base_velocity: f32,
    pub rotation_rate: f32,
    pub angle_move: f32,
    pub max_target_offset: f32,
    pub max_gain: f32,
    pub command_queue: usize,
}

impl Default for OperatorCfg {
    fn default() -> Self {
        Self {
            base_velocity: 500.0,
            rotation_rate: 45.0,
            angle_move: 3.0,
            max_target_offset: 10.0,
            max_gain: 1000.0,
            command_queue: 64,
        }
    }
}

/// Everything `BalanceLoop` needs besides its devices.
#[derive(Debug, Clone, Default)]
pub struct BalanceCfg {
    pub loop_: LoopCfg,
    pub estimator: EstimatorCfg,
    pub safety: SafetyCfg,
    pub stages: StagesCfg,
    pub calibration: CalibrationCfg,
    pub operator: OperatorCfg,
}
