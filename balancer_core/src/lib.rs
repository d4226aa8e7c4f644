#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Balance control core (hardware-agnostic).
//!
//! All device access goes through the `balancer_traits` contracts
//! (`TiltSensor`, `Actuator`, `PositionSource`, `CurrentSource`), and all
//! timing through `balancer_traits::Clock`.
//!
//! ## Architecture
//!
//! - **Angle Estimator**: mounting offset plus direct, complementary or
//!   low-pass fusion (`estimator`)
//! - **PID Stage**: one clamped PID with anti-windup, four instances
//!   (`pid`): velocity -> tilt target, tilt -> torque, torque feedback,
//!   yaw rate -> differential
//! - **Safety Monitor**: soft/hard tilt envelope with grace period
//!   (`safety`)
//! - **Command Mixer**: torque and differential to per-side commands
//!   (`mixer`)
//! - **Scheduler**: fixed-rate `BalanceLoop` with per-stage dividers
//!   (`scheduler`, `schedule`)
//! - **Operator surface**: queued typed updates and a lock-free telemetry
//!   snapshot (`operator`, `telemetry`)
//!
//! ## Sign conventions
//!
//! Positive tilt is a forward lean. A positive actuator command drives its
//! wheel forward. A positive yaw rate (right wheel faster) turns left.

pub mod config;
pub mod conversions;
pub mod error;
pub mod estimator;
pub mod hw_error;
pub mod mixer;
pub mod mocks;
pub mod operator;
pub mod pid;
pub mod safety;
pub mod schedule;
pub mod scheduler;
pub mod telemetry;
pub mod util;

pub use config::{
    BalanceCfg, CalibrationCfg, EstimatorCfg, LoopCfg, OperatorCfg, SafetyCfg, StageCfg,
    StagesCfg,
};
pub use error::{BalanceError, BuildError, Report, Result};
pub use estimator::{AngleEstimator, FusionMode, TiltEstimate};
pub use mixer::{MotorCommand, mix};
pub use operator::{Movement, OperatorCommand, OperatorHandle, StageId, UpdateBounds};
pub use pid::{Action, OutputLimits, PidGains, PidStage};
pub use safety::{SafetyDecision, SafetyMonitor, SafetyState, SafetyZone, Transition};
pub use schedule::{LoopSchedule, RateDivider};
pub use scheduler::{BalanceLoop, BalanceLoopBuilder, Missing, Set, TickReport, TimingStats};
pub use telemetry::{SnapshotCell, StageTelemetry, Telemetry};
