//! Deterministic physics stand-in for the two-wheeled body.
//!
//! One shared [`SimulatedPlant`] hands out an IMU, two motors, two encoders
//! and two current sensors that all act on the same state. Physics advance
//! lazily to `clock.now()` whenever any handle touches the plant, so under a
//! `TestClock` the whole run is reproducible.
//!
//! Sign convention: positive pitch is a forward lean, a positive motor
//! command drives that wheel forward, and driving forward pushes the base
//! under the body (reduces a forward lean).

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use balancer_traits::{Actuator, Clock, CurrentSource, PositionSource, TiltSensor};
use tracing::{debug, trace};

use crate::Side;
use crate::error::{HwError, Result};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Physical constants of the simulated body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantParams {
    /// Gravity coupling in 1/s^2 (destabilising, pitch grows with itself).
    pub gravity: f32,
    /// Pitch acceleration (deg/s^2) per unit of mean wheel command.
    pub drive_gain: f32,
    /// Viscous pitch damping in 1/s.
    pub damping: f32,
    /// Yaw acceleration (deg/s^2) per unit of right-minus-left command.
    pub yaw_gain: f32,
    pub yaw_damping: f32,
    /// Encoder ticks per second at full command.
    pub ticks_per_command_s: f32,
    /// Raw current units at full command.
    pub current_per_command: f32,
    /// Largest integration sub-step.
    pub step: Duration,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            gravity: 1.5,
            drive_gain: 1000.0,
            damping: 0.6,
            yaw_gain: 400.0,
            yaw_damping: 4.0,
            ticks_per_command_s: 2688.0,
            current_per_command: 400.0,
            step: Duration::from_millis(1),
        }
    }
}

/// Copy of the plant state for assertions and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantSnapshot {
    pub pitch: f32,
    pub pitch_rate: f32,
    pub yaw_rate: f32,
    pub commands: [f32; 2],
    pub enabled: [bool; 2],
    pub positions: [f64; 2],
    pub travel: [f64; 2],
}

#[derive(Debug)]
struct PlantState {
    pitch: f32,
    pitch_rate: f32,
    yaw_rate: f32,
    commands: [f32; 2],
    enabled: [bool; 2],
    positions: [f64; 2],
    travel: [f64; 2],
    held_pitch: Option<f32>,
    imu_fault: bool,
    last: Instant,
}

impl PlantState {
    fn effective_command(&self, side: Side) -> f32 {
        let i = side.index();
        if self.enabled[i] { self.commands[i] } else { 0.0 }
    }

    fn advance(&mut self, params: &PlantParams, now: Instant) {
        let mut remaining = now.saturating_duration_since(self.last);
        self.last = now;
        if remaining.is_zero() {
            return;
        }
        let left = self.effective_command(Side::Left);
        let right = self.effective_command(Side::Right);
        let drive = 0.5 * (left + right);
        let turn = right - left;

        while !remaining.is_zero() {
            let h = remaining.min(params.step);
            remaining -= h;
            let dt = h.as_secs_f32();

            match self.held_pitch {
                Some(p) => {
                    self.pitch = p;
                    self.pitch_rate = 0.0;
                }
                None => {
                    let acc = params.gravity * self.pitch
                        - params.drive_gain * drive
                        - params.damping * self.pitch_rate;
                    // semi-implicit Euler
                    self.pitch_rate += acc * dt;
                    self.pitch += self.pitch_rate * dt;
                    if self.pitch.abs() >= 90.0 {
                        // lying on the ground
                        self.pitch = 90.0_f32.copysign(self.pitch);
                        self.pitch_rate = 0.0;
                    }
                }
            }

            let yaw_acc = params.yaw_gain * turn - params.yaw_damping * self.yaw_rate;
            self.yaw_rate += yaw_acc * dt;

            for (i, cmd) in [left, right].into_iter().enumerate() {
                let delta = f64::from(cmd * params.ticks_per_command_s * dt);
                self.positions[i] += delta;
                self.travel[i] += delta.abs();
            }
        }
    }
}

/// Shared simulated body. Clone freely; all clones act on one state.
#[derive(Clone)]
pub struct SimulatedPlant<C: Clock + Clone> {
    state: Arc<Mutex<PlantState>>,
    params: PlantParams,
    clock: C,
    read_latency: Duration,
}

impl<C: Clock + Clone> SimulatedPlant<C> {
    pub fn new(clock: C) -> Self {
        Self::with_params(clock, PlantParams::default())
    }

    pub fn with_params(clock: C, params: PlantParams) -> Self {
        let state = PlantState {
            pitch: 0.0,
            pitch_rate: 0.0,
            yaw_rate: 0.0,
            commands: [0.0; 2],
            enabled: [false; 2],
            positions: [0.0; 2],
            travel: [0.0; 2],
            held_pitch: None,
            imu_fault: false,
            last: clock.now(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            params,
            clock,
            read_latency: Duration::ZERO,
        }
    }

    /// Every IMU read consumes this much clock time before sampling.
    pub fn with_read_latency(mut self, latency: Duration) -> Self {
        self.read_latency = latency;
        self
    }

    pub fn params(&self) -> &PlantParams {
        &self.params
    }

    fn lock(&self) -> Result<MutexGuard<'_, PlantState>> {
        let mut guard = self.state.lock().map_err(|_| HwError::Poisoned)?;
        guard.advance(&self.params, self.clock.now());
        Ok(guard)
    }

    /// Place the body at `pitch` degrees, at rest.
    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        let mut s = self.lock()?;
        s.pitch = pitch;
        s.pitch_rate = 0.0;
        Ok(())
    }

    /// Pin the pitch to a fixed value (`None` releases it to the dynamics).
    pub fn hold_pitch(&self, pitch: Option<f32>) -> Result<()> {
        let mut s = self.lock()?;
        s.held_pitch = pitch;
        if let Some(p) = pitch {
            s.pitch = p;
            s.pitch_rate = 0.0;
        }
        Ok(())
    }

    /// Make subsequent IMU reads fail.
    pub fn fail_imu(&self, fail: bool) -> Result<()> {
        self.lock()?.imu_fault = fail;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<PlantSnapshot> {
        let s = self.lock()?;
        Ok(PlantSnapshot {
            pitch: s.pitch,
            pitch_rate: s.pitch_rate,
            yaw_rate: s.yaw_rate,
            commands: s.commands,
            enabled: s.enabled,
            positions: s.positions,
            travel: s.travel,
        })
    }

    pub fn imu(&self) -> SimImu<C> {
        SimImu {
            plant: self.clone(),
        }
    }

    pub fn motor(&self, side: Side) -> SimMotor<C> {
        SimMotor {
            plant: self.clone(),
            side,
        }
    }

    pub fn encoder(&self, side: Side) -> SimEncoder<C> {
        SimEncoder {
            plant: self.clone(),
            side,
            origin: 0.0,
        }
    }

    pub fn current_sensor(&self, side: Side) -> SimCurrentSensor<C> {
        SimCurrentSensor {
            plant: self.clone(),
            side,
        }
    }

    fn read_imu(&self, read: impl FnOnce(&PlantState) -> f32) -> Result<f32> {
        if !self.read_latency.is_zero() {
            self.clock.sleep(self.read_latency);
        }
        let s = self.lock()?;
        if s.imu_fault {
            return Err(HwError::I2c("simulated imu read failure".into()));
        }
        let v = read(&s);
        trace!(value = v, "sim imu read");
        Ok(v)
    }
}

pub struct SimImu<C: Clock + Clone> {
    plant: SimulatedPlant<C>,
}

impl<C: Clock + Clone> TiltSensor for SimImu<C> {
    fn read_tilt(&mut self) -> std::result::Result<f32, BoxError> {
        Ok(self.plant.read_imu(|s| s.pitch)?)
    }

    fn read_angular_rate_pitch(&mut self) -> std::result::Result<f32, BoxError> {
        Ok(self.plant.read_imu(|s| s.pitch_rate)?)
    }

    fn read_angular_rate_yaw(&mut self) -> std::result::Result<f32, BoxError> {
        Ok(self.plant.read_imu(|s| s.yaw_rate)?)
    }
}

pub struct SimMotor<C: Clock + Clone> {
    plant: SimulatedPlant<C>,
    side: Side,
}

impl<C: Clock + Clone> Actuator for SimMotor<C> {
    fn start(&mut self) -> std::result::Result<(), BoxError> {
        let mut s = self.plant.lock()?;
        s.enabled[self.side.index()] = true;
        s.commands[self.side.index()] = 0.0;
        debug!(side = ?self.side, "sim motor started");
        Ok(())
    }

    fn stop(&mut self) -> std::result::Result<(), BoxError> {
        let mut s = self.plant.lock()?;
        s.enabled[self.side.index()] = false;
        s.commands[self.side.index()] = 0.0;
        debug!(side = ?self.side, "sim motor stopped");
        Ok(())
    }

    fn set_command(&mut self, value: f32) -> std::result::Result<(), BoxError> {
        if !value.is_finite() {
            return Err(HwError::InvalidReading(format!("motor command {value}")).into());
        }
        let mut s = self.plant.lock()?;
        s.commands[self.side.index()] = value.clamp(-1.0, 1.0);
        Ok(())
    }
}

pub struct SimEncoder<C: Clock + Clone> {
    plant: SimulatedPlant<C>,
    side: Side,
    origin: f64,
}

impl<C: Clock + Clone> PositionSource for SimEncoder<C> {
    fn position(&mut self) -> std::result::Result<i64, BoxError> {
        let s = self.plant.lock()?;
        Ok((s.positions[self.side.index()] - self.origin).round() as i64)
    }

    /// Commanded wheel speed in ticks/s, not a rate derived from `position`.
    fn velocity(&mut self) -> std::result::Result<f32, BoxError> {
        let s = self.plant.lock()?;
        Ok(s.effective_command(self.side) * self.plant.params.ticks_per_command_s)
    }

    fn reset(&mut self) -> std::result::Result<(), BoxError> {
        let s = self.plant.lock()?;
        self.origin = s.positions[self.side.index()];
        Ok(())
    }
}

pub struct SimCurrentSensor<C: Clock + Clone> {
    plant: SimulatedPlant<C>,
    side: Side,
}

impl<C: Clock + Clone> CurrentSource for SimCurrentSensor<C> {
    fn read_current(&mut self) -> std::result::Result<i32, BoxError> {
        let s = self.plant.lock()?;
        Ok((s.effective_command(self.side) * self.plant.params.current_per_command).round() as i32)
    }
}
