use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BalanceError {
    /// Sensor or actuator failure; actuators have been asked to stop.
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    /// Operator-submitted value rejected; the previous value is kept.
    #[error("invalid configuration update: {0}")]
    InvalidConfigurationUpdate(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid state: {0}")]
    State(String),
    #[error("control loop is not running")]
    Disconnected,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing tilt sensor")]
    MissingTiltSensor,
    #[error("missing actuators")]
    MissingActuators,
    #[error("velocity stage enabled without position sources")]
    MissingPositionSources,
    #[error("torque stage enabled without current sources")]
    MissingCurrentSources,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
