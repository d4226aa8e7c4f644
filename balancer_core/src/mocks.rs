//! Scriptable devices for driving `BalanceLoop` in tests and benches.
//!
//! Each device shares its state through an `Arc`, so a test keeps one handle
//! to steer inputs or inspect writes while the loop owns the boxed device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};

use crate::util::AtomicF32;

type DevResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn fault(what: &str) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(std::io::Error::other(format!("{what} failed (mock)")))
}

/// Inputs seen by a `MockTilt`.
#[derive(Debug, Default)]
pub struct TiltInput {
    pub tilt: AtomicF32,
    pub pitch_rate: AtomicF32,
    pub yaw_rate: AtomicF32,
    pub fail: AtomicBool,
    pub reads: AtomicU32,
}

impl TiltInput {
    pub fn set_tilt(&self, deg: f32) {
        self.tilt.store(deg, Ordering::Relaxed);
    }

    pub fn set_yaw_rate(&self, dps: f32) {
        self.yaw_rate.store(dps, Ordering::Relaxed);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockTilt(pub Arc<TiltInput>);

impl MockTilt {
    pub fn new() -> (Self, Arc<TiltInput>) {
        let input = Arc::new(TiltInput::default());
        (Self(Arc::clone(&input)), input)
    }

    fn check(&self, what: &str) -> DevResult<()> {
        if self.0.fail.load(Ordering::Relaxed) {
            Err(fault(what))
        } else {
            Ok(())
        }
    }
}

impl balancer_traits::TiltSensor for MockTilt {
    fn read_tilt(&mut self) -> DevResult<f32> {
        self.check("tilt read")?;
        self.0.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.0.tilt.load(Ordering::Relaxed))
    }

    fn read_angular_rate_pitch(&mut self) -> DevResult<f32> {
        self.check("pitch rate read")?;
        Ok(self.0.pitch_rate.load(Ordering::Relaxed))
    }

    fn read_angular_rate_yaw(&mut self) -> DevResult<f32> {
        self.check("yaw rate read")?;
        Ok(self.0.yaw_rate.load(Ordering::Relaxed))
    }
}

/// What a `RecordingActuator` has been told.
#[derive(Debug, Default)]
pub struct ActuatorLog {
    pub started: AtomicBool,
    pub command: AtomicF32,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
    pub writes: AtomicU32,
    pub fail_writes: AtomicBool,
}

impl ActuatorLog {
    pub fn command(&self) -> f32 {
        self.command.load(Ordering::Relaxed)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingActuator(pub Arc<ActuatorLog>);

impl RecordingActuator {
    pub fn new() -> (Self, Arc<ActuatorLog>) {
        let log = Arc::new(ActuatorLog::default());
        (Self(Arc::clone(&log)), log)
    }
}

impl balancer_traits::Actuator for RecordingActuator {
    fn start(&mut self) -> DevResult<()> {
        self.0.started.store(true, Ordering::Relaxed);
        self.0.starts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&mut self) -> DevResult<()> {
        self.0.started.store(false, Ordering::Relaxed);
        self.0.command.store(0.0, Ordering::Relaxed);
        self.0.stops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_command(&mut self, value: f32) -> DevResult<()> {
        if self.0.fail_writes.load(Ordering::Relaxed) {
            return Err(fault("actuator write"));
        }
        self.0.command.store(value, Ordering::Relaxed);
        self.0.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Encoder whose position and velocity are set directly by the test.
#[derive(Debug, Clone, Default)]
pub struct MockPosition {
    pub position: Arc<AtomicI64>,
    pub velocity: Arc<AtomicF32>,
}

impl balancer_traits::PositionSource for MockPosition {
    fn position(&mut self) -> DevResult<i64> {
        Ok(self.position.load(Ordering::Relaxed))
    }

    fn velocity(&mut self) -> DevResult<f32> {
        Ok(self.velocity.load(Ordering::Relaxed))
    }

    fn reset(&mut self) -> DevResult<()> {
        self.position.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockCurrent(pub Arc<AtomicI32>);

impl balancer_traits::CurrentSource for MockCurrent {
    fn read_current(&mut self) -> DevResult<i32> {
        Ok(self.0.load(Ordering::Relaxed))
    }
}
