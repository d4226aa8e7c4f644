//! Operator surface: typed updates sent to the control thread and a
//! read-only view of its telemetry.
//!
//! Updates travel over a bounded channel and are drained at the start of a
//! tick, so a stage never sees a half-applied change. Values are checked
//! here, before sending, and again when the loop applies them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};

use crate::error::{BalanceError, Result};
use crate::pid::PidGains;
use crate::telemetry::{SnapshotCell, Telemetry};

/// Cascade stages, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    Velocity,
    Tilt,
    Torque,
    Yaw,
}

impl StageId {
    pub const COUNT: usize = 4;
    pub const ALL: [StageId; StageId::COUNT] = [
        StageId::Velocity,
        StageId::Tilt,
        StageId::Torque,
        StageId::Yaw,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            StageId::Velocity => "velocity",
            StageId::Tilt => "tilt",
            StageId::Torque => "torque",
            StageId::Yaw => "yaw",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageId {
    type Err = BalanceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        StageId::ALL
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                BalanceError::InvalidConfigurationUpdate(format!(
                    "unknown stage '{s}' (expected velocity, tilt, torque or yaw)"
                ))
            })
    }
}

/// Movement presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    Forward,
    Backward,
    RotateLeft,
    RotateRight,
    Stop,
}

impl FromStr for Movement {
    type Err = BalanceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "forward" => Ok(Movement::Forward),
            "backward" => Ok(Movement::Backward),
            "rotate_left" | "left" => Ok(Movement::RotateLeft),
            "rotate_right" | "right" => Ok(Movement::RotateRight),
            "stop" => Ok(Movement::Stop),
            other => Err(BalanceError::InvalidConfigurationUpdate(format!(
                "unknown movement '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorCommand {
    /// Replace all three gains of one stage.
    SetGains { stage: StageId, gains: PidGains },
    SetSetpoint { stage: StageId, value: f32 },
    /// Degrees added to the neutral tilt target.
    SetTargetOffset(f32),
    Move(Movement),
}

/// Bounds an operator update must respect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateBounds {
    pub max_gain: f32,
    pub max_target_offset: f32,
    pub neutral_angle: f32,
}

impl OperatorCommand {
    /// Check the command and bring it to the form the loop applies.
    ///
    /// The tilt stage's setpoint is owned by the cascade, so a tilt setpoint
    /// becomes a target offset relative to neutral. The torque setpoint is
    /// always the tilt stage's output and cannot be set.
    pub fn normalize(self, b: &UpdateBounds) -> std::result::Result<Self, BalanceError> {
        match self {
            OperatorCommand::SetGains { stage, gains } => {
                gains
                    .check(b.max_gain)
                    .map_err(|e| prefixed(stage, e))?;
                Ok(self)
            }
            OperatorCommand::SetSetpoint { stage, value } => {
                if !value.is_finite() {
                    return Err(BalanceError::InvalidConfigurationUpdate(format!(
                        "{stage} setpoint must be finite, got {value}"
                    )));
                }
                match stage {
                    StageId::Tilt => {
                        OperatorCommand::SetTargetOffset(value - b.neutral_angle).normalize(b)
                    }
                    StageId::Torque => Err(BalanceError::InvalidConfigurationUpdate(
                        "torque setpoint is driven by the tilt stage".into(),
                    )),
                    StageId::Velocity | StageId::Yaw => Ok(self),
                }
            }
            OperatorCommand::SetTargetOffset(offset) => {
                if !offset.is_finite() || offset.abs() > b.max_target_offset {
                    return Err(BalanceError::InvalidConfigurationUpdate(format!(
                        "target offset {offset} outside [-{m}, {m}]",
                        m = b.max_target_offset
                    )));
                }
                Ok(self)
            }
            OperatorCommand::Move(_) => Ok(self),
        }
    }
}

fn prefixed(stage: StageId, e: BalanceError) -> BalanceError {
    match e {
        BalanceError::InvalidConfigurationUpdate(msg) => {
            BalanceError::InvalidConfigurationUpdate(format!("{stage}: {msg}"))
        }
        other => other,
    }
}

/// Cloneable handle held by the operator thread.
#[derive(Debug, Clone)]
pub struct OperatorHandle {
    tx: Sender<OperatorCommand>,
    telemetry: Arc<SnapshotCell>,
    bounds: UpdateBounds,
}

impl OperatorHandle {
    pub(crate) fn new(
        tx: Sender<OperatorCommand>,
        telemetry: Arc<SnapshotCell>,
        bounds: UpdateBounds,
    ) -> Self {
        Self {
            tx,
            telemetry,
            bounds,
        }
    }

    /// Validate and queue one update for the next tick.
    pub fn submit(&self, cmd: OperatorCommand) -> Result<()> {
        let cmd = cmd.normalize(&self.bounds).map_err(|e| {
            tracing::warn!(error = %e, "operator update rejected");
            eyre::Report::new(e)
        })?;
        match self.tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(eyre::Report::new(BalanceError::State(
                "operator queue full; update dropped".into(),
            ))),
            Err(TrySendError::Disconnected(_)) => {
                Err(eyre::Report::new(BalanceError::Disconnected))
            }
        }
    }

    pub fn set_gains(&self, stage: StageId, gains: PidGains) -> Result<()> {
        self.submit(OperatorCommand::SetGains { stage, gains })
    }

    pub fn set_setpoint(&self, stage: StageId, value: f32) -> Result<()> {
        self.submit(OperatorCommand::SetSetpoint { stage, value })
    }

    pub fn set_target_offset(&self, offset: f32) -> Result<()> {
        self.submit(OperatorCommand::SetTargetOffset(offset))
    }

    pub fn movement(&self, m: Movement) -> Result<()> {
        self.submit(OperatorCommand::Move(m))
    }

    /// Latest complete telemetry snapshot.
    pub fn telemetry(&self) -> Telemetry {
        self.telemetry.read()
    }

    /// Number of snapshots published so far.
    pub fn telemetry_version(&self) -> u64 {
        self.telemetry.version()
    }

    /// Gains as applied by the loop at the last published tick.
    pub fn gains(&self, stage: StageId) -> PidGains {
        self.telemetry().stage(stage).gains
    }

    pub fn setpoint(&self, stage: StageId) -> f32 {
        self.telemetry().stage(stage).setpoint
    }

    pub fn target_offset(&self) -> f32 {
        self.telemetry().target_offset
    }

    pub fn bounds(&self) -> UpdateBounds {
        self.bounds
    }
}
