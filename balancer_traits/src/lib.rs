//! Collaborator contracts consumed by the balance controller.
//!
//! Hardware and simulated backends implement these; the core only ever sees
//! the traits. All methods report failures as boxed errors so a backend can
//! surface its own typed error without the core depending on it.

pub mod clock;

pub use clock::{Clock, MonotonicClock};

/// Pitch/yaw sensor. Angles in degrees, rates in degrees per second.
///
/// Reads are synchronous and may be slow; callers budget for the worst case
/// rather than retrying.
pub trait TiltSensor {
    fn read_tilt(&mut self) -> Result<f32, Box<dyn std::error::Error + Send + Sync>>;
    fn read_angular_rate_pitch(&mut self) -> Result<f32, Box<dyn std::error::Error + Send + Sync>>;
    fn read_angular_rate_yaw(&mut self) -> Result<f32, Box<dyn std::error::Error + Send + Sync>>;
}

/// One wheel drive. `set_command` takes a normalized value in `[-1, 1]`.
pub trait Actuator {
    fn start(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn stop(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn set_command(&mut self, value: f32) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Incremental wheel position source (quadrature encoder or simulation).
pub trait PositionSource {
    /// Signed position in ticks.
    fn position(&mut self) -> Result<i64, Box<dyn std::error::Error + Send + Sync>>;
    /// Signed velocity in ticks per second.
    fn velocity(&mut self) -> Result<f32, Box<dyn std::error::Error + Send + Sync>>;
    fn reset(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Motor current sense. Raw signed ADC units; conversion to torque is a
/// calibration concern of the caller.
pub trait CurrentSource {
    fn read_current(&mut self) -> Result<i32, Box<dyn std::error::Error + Send + Sync>>;
}

impl<T: TiltSensor + ?Sized> TiltSensor for Box<T> {
    fn read_tilt(&mut self) -> Result<f32, Box<dyn std::error::Error + Send + Sync>> {
        (**self).read_tilt()
    }
    fn read_angular_rate_pitch(&mut self) -> Result<f32, Box<dyn std::error::Error + Send + Sync>> {
        (**self).read_angular_rate_pitch()
    }
    fn read_angular_rate_yaw(&mut self) -> Result<f32, Box<dyn std::error::Error + Send + Sync>> {
        (**self).read_angular_rate_yaw()
    }
}

impl<T: Actuator + ?Sized> Actuator for Box<T> {
    fn start(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).start()
    }
    fn stop(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).stop()
    }
    fn set_command(&mut self, value: f32) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).set_command(value)
    }
}

impl<T: PositionSource + ?Sized> PositionSource for Box<T> {
    fn position(&mut self) -> Result<i64, Box<dyn std::error::Error + Send + Sync>> {
        (**self).position()
    }
    fn velocity(&mut self) -> Result<f32, Box<dyn std::error::Error + Send + Sync>> {
        (**self).velocity()
    }
    fn reset(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        (**self).reset()
    }
}

impl<T: CurrentSource + ?Sized> CurrentSource for Box<T> {
    fn read_current(&mut self) -> Result<i32, Box<dyn std::error::Error + Send + Sync>> {
        (**self).read_current()
    }
}
