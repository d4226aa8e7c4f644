//! The fixed-rate control loop (`BalanceLoop`) and its type-state builder.
//!
//! One tick, in order: drain operator updates, sample and fuse tilt, let the
//! safety monitor decide, evaluate due stages outer to inner (velocity, yaw,
//! tilt, torque), mix, write both actuators, publish telemetry, pace.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use balancer_traits::clock::{Clock, MonotonicClock};
use balancer_traits::{Actuator, CurrentSource, PositionSource, TiltSensor};
use crossbeam_channel::{Receiver, bounded};
use eyre::WrapErr;

use crate::config::BalanceCfg;
use crate::error::{BalanceError, BuildError, Result};
use crate::estimator::{AngleEstimator, FusionMode, TiltEstimate};
use crate::hw_error::map_hw_error;
use crate::mixer::{MotorCommand, mix};
use crate::operator::{Movement, OperatorCommand, OperatorHandle, StageId, UpdateBounds};
use crate::pid::{Action, PidStage};
use crate::safety::{SafetyMonitor, SafetyState, SafetyZone, Transition};
use crate::schedule::LoopSchedule;
use crate::telemetry::{SnapshotCell, StageTelemetry, Telemetry};
use crate::util::{mean2, period, ticks_in};

type DevResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn hw<T>(r: DevResult<T>, what: &'static str) -> Result<T> {
    r.map_err(|e| eyre::Report::new(map_hw_error(&*e)))
        .wrap_err(what)
}

const LEFT: usize = 0;
const RIGHT: usize = 1;

/// Tick duration bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingStats {
    pub ticks: u64,
    pub min: Duration,
    pub max: Duration,
    total: Duration,
    pub overruns: u64,
    pub consecutive_overruns: u64,
    /// Consecutive overruns reached `loop.sustained_overrun_ticks`.
    pub sustained: bool,
}

impl TimingStats {
    pub fn avg(&self) -> Duration {
        if self.ticks == 0 {
            return Duration::ZERO;
        }
        self.total / u32::try_from(self.ticks).unwrap_or(u32::MAX)
    }

    /// Average tick duration as a fraction of `period`.
    pub fn budget_ratio(&self, period: Duration) -> f32 {
        if period.is_zero() {
            return 0.0;
        }
        self.avg().as_secs_f32() / period.as_secs_f32()
    }

    fn record(&mut self, elapsed: Duration, overrun: bool, sustained_after: u32) {
        self.min = if self.ticks == 0 {
            elapsed
        } else {
            self.min.min(elapsed)
        };
        self.max = self.max.max(elapsed);
        self.total += elapsed;
        self.ticks += 1;
        if overrun {
            self.overruns += 1;
            self.consecutive_overruns += 1;
        } else {
            self.consecutive_overruns = 0;
        }
        self.sustained = self.consecutive_overruns >= u64::from(sustained_after);
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub estimate: TiltEstimate,
    pub state: SafetyState,
    pub zone: SafetyZone,
    pub transition: Option<Transition>,
    pub command: MotorCommand,
    pub target_angle: f32,
    pub torque: f32,
    pub differential: f32,
    /// Work time of the tick, before pacing.
    pub elapsed: Duration,
    pub overrun: bool,
}

pub struct BalanceLoop {
    tilt: Box<dyn TiltSensor + Send>,
    actuators: [Box<dyn Actuator + Send>; 2],
    positions: Option<[Box<dyn PositionSource + Send>; 2]>,
    currents: Option<[Box<dyn CurrentSource + Send>; 2]>,
    clock: Arc<dyn Clock + Send + Sync>,
    cfg: BalanceCfg,
    period: Duration,

    estimator: AngleEstimator,
    safety: SafetyMonitor,
    stages: [PidStage; StageId::COUNT],
    enabled: [bool; StageId::COUNT],
    schedule: LoopSchedule,

    rx: Receiver<OperatorCommand>,
    handle: OperatorHandle,
    telemetry: Arc<SnapshotCell>,
    bounds: UpdateBounds,

    started: bool,
    epoch: Instant,
    last_sample_at: Option<Instant>,
    tick: u64,
    target_offset: f32,
    open_loop_differential: f32,
    velocity: Option<f32>,
    last_positions: Option<[i64; 2]>,
    travel: f32,
    stats: TimingStats,
    window: TimingStats,
    status_every: u64,
    timing_every: u64,
}

impl core::fmt::Debug for BalanceLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BalanceLoop")
            .field("rate_hz", &self.cfg.loop_.rate_hz)
            .field("tick", &self.tick)
            .field("state", &self.safety.state())
            .field("started", &self.started)
            .finish()
    }
}

impl BalanceLoop {
    pub fn builder() -> BalanceLoopBuilder<Missing, Missing> {
        BalanceLoopBuilder::default()
    }

    /// New handle for an operator thread.
    pub fn operator_handle(&self) -> OperatorHandle {
        self.handle.clone()
    }

    /// Start both actuators and open the safety grace period. Called by the
    /// first `tick` if not called explicitly.
    ///
    /// A device failure here stops both actuators before the error is
    /// returned, so no actuator is left running after an aborted startup.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if let Err(e) = self.start_devices() {
            self.emergency_stop(&e);
            return Err(e);
        }
        let now = self.clock.now();
        self.epoch = now;
        self.safety.reset(now);
        self.schedule.reset();
        self.estimator.reset();
        self.last_sample_at = None;
        self.last_positions = None;
        self.started = true;
        tracing::info!(
            rate_hz = self.cfg.loop_.rate_hz,
            velocity = self.enabled[StageId::Velocity.index()],
            yaw = self.enabled[StageId::Yaw.index()],
            torque = self.enabled[StageId::Torque.index()],
            "control loop started"
        );
        Ok(())
    }

    /// Zero and stop both actuators.
    pub fn stop(&mut self) -> Result<()> {
        self.started = false;
        let mut first_err = None;
        for a in &mut self.actuators {
            let r = hw(a.set_command(0.0), "zeroing actuator")
                .and_then(|()| hw(a.stop(), "stopping actuator"));
            if let Err(e) = r {
                tracing::warn!(error = %e, "actuator stop failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run one full tick, pacing to the tick period with the loop's clock.
    ///
    /// A sensor or actuator failure stops both actuators before the error is
    /// returned.
    pub fn tick(&mut self) -> Result<TickReport> {
        let t0 = self.clock.now();
        if !self.started {
            self.start()?;
        }
        self.drain_operator();

        let report = match self.evaluate() {
            Ok(r) => r,
            Err(e) => {
                self.emergency_stop(&e);
                return Err(e);
            }
        };

        let elapsed = self.clock.now().saturating_duration_since(t0);
        let overrun = elapsed > self.period;
        let report = TickReport {
            elapsed,
            overrun,
            ..report
        };
        self.record_timing(elapsed, overrun);
        self.publish(&report);
        self.periodic_logs(&report);

        self.clock.sleep(self.period.saturating_sub(elapsed));
        Ok(report)
    }

    /// Tick until `shutdown` is set or `max_duration` has elapsed, then stop
    /// the actuators.
    pub fn run(
        &mut self,
        shutdown: &AtomicBool,
        max_duration: Option<Duration>,
    ) -> Result<TimingStats> {
        self.start()?;
        let began = self.clock.now();
        while !shutdown.load(Ordering::Relaxed) {
            if let Some(max) = max_duration
                && self.clock.now().saturating_duration_since(began) >= max
            {
                break;
            }
            self.tick()?;
        }
        self.stop()?;
        tracing::info!(
            ticks = self.stats.ticks,
            overruns = self.stats.overruns,
            trips = self.safety.trips(),
            "control loop stopped"
        );
        Ok(self.stats)
    }

    pub fn safety_state(&self) -> SafetyState {
        self.safety.state()
    }

    pub fn stats(&self) -> TimingStats {
        self.stats
    }

    pub fn stage(&self, id: StageId) -> &PidStage {
        &self.stages[id.index()]
    }

    pub fn is_enabled(&self, id: StageId) -> bool {
        self.enabled[id.index()]
    }

    pub fn target_offset(&self) -> f32 {
        self.target_offset
    }

    pub fn telemetry(&self) -> Telemetry {
        self.telemetry.read()
    }

    pub fn config(&self) -> &BalanceCfg {
        &self.cfg
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    // ── Operator updates ─────────────────────────────────────────────────────

    fn drain_operator(&mut self) {
        for _ in 0..self.cfg.operator.command_queue {
            match self.rx.try_recv() {
                Ok(cmd) => self.apply(cmd),
                Err(_) => break,
            }
        }
    }

    fn apply(&mut self, cmd: OperatorCommand) {
        let cmd = match cmd.normalize(&self.bounds) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "operator update rejected");
                return;
            }
        };
        match cmd {
            OperatorCommand::SetGains { stage, gains } => {
                match self.stages[stage.index()].set_gains(gains) {
                    Ok(()) => tracing::info!(
                        stage = stage.name(),
                        kp = gains.kp,
                        ki = gains.ki,
                        kd = gains.kd,
                        "gains updated"
                    ),
                    Err(e) => tracing::warn!(error = %e, "operator update rejected"),
                }
            }
            OperatorCommand::SetSetpoint { stage, value } => {
                match self.stages[stage.index()].set_setpoint(value) {
                    Ok(()) => tracing::info!(stage = stage.name(), value, "setpoint updated"),
                    Err(e) => tracing::warn!(error = %e, "operator update rejected"),
                }
            }
            OperatorCommand::SetTargetOffset(offset) => {
                self.target_offset = offset;
                tracing::info!(offset, "target offset updated");
            }
            OperatorCommand::Move(m) => self.apply_movement(m),
        }
    }

    fn set_stage_setpoint(&mut self, id: StageId, value: f32) {
        if let Err(e) = self.stages[id.index()].set_setpoint(value) {
            tracing::warn!(error = %e, "preset setpoint rejected");
        }
    }

    fn apply_movement(&mut self, m: Movement) {
        let op = self.cfg.operator.clone();
        let velocity_on = self.enabled[StageId::Velocity.index()];
        let yaw_on = self.enabled[StageId::Yaw.index()];
        match m {
            Movement::Forward | Movement::Backward => {
                let sign = if m == Movement::Forward { 1.0 } else { -1.0 };
                if velocity_on {
                    self.set_stage_setpoint(StageId::Velocity, sign * op.base_velocity);
                } else {
                    self.target_offset = sign * op.angle_move;
                }
                self.set_stage_setpoint(StageId::Yaw, 0.0);
                self.open_loop_differential = 0.0;
            }
            Movement::RotateLeft | Movement::RotateRight => {
                let left = m == Movement::RotateLeft;
                if yaw_on {
                    let sign = if left { 1.0 } else { -1.0 };
                    self.set_stage_setpoint(StageId::Yaw, sign * op.rotation_rate);
                } else {
                    let limits = self.stages[StageId::Yaw.index()].limits();
                    self.open_loop_differential = if left { limits.max() } else { limits.min() };
                }
                self.set_stage_setpoint(StageId::Velocity, 0.0);
            }
            Movement::Stop => {
                self.set_stage_setpoint(StageId::Velocity, 0.0);
                self.set_stage_setpoint(StageId::Yaw, 0.0);
                self.open_loop_differential = 0.0;
                self.target_offset = 0.0;
            }
        }
        tracing::info!(movement = ?m, "movement preset");
    }

    // ── One tick ─────────────────────────────────────────────────────────────

    fn sample(&mut self) -> Result<TiltEstimate> {
        let raw = hw(self.tilt.read_tilt(), "reading tilt")?;
        let rate = if self.estimator.needs_rate() {
            Some(hw(self.tilt.read_angular_rate_pitch(), "reading pitch rate")?)
        } else {
            None
        };
        let at = self.clock.now();
        let dt = match self.last_sample_at {
            Some(prev) => at.saturating_duration_since(prev).as_secs_f32(),
            None => self.period.as_secs_f32(),
        };
        self.last_sample_at = Some(at);
        let estimate = self
            .estimator
            .estimate(raw, rate, dt, at)
            .map_err(eyre::Report::new)
            .wrap_err("estimating tilt")?;
        tracing::trace!(
            raw = estimate.raw_angle,
            filtered = estimate.filtered_angle,
            dt,
            "tilt sample"
        );
        Ok(estimate)
    }

    fn evaluate(&mut self) -> Result<TickReport> {
        self.tick += 1;
        let estimate = self.sample()?;
        let at = estimate.timestamp;
        let prev_zone = self.safety.zone();
        let decision = self.safety.observe(estimate.filtered_angle, at);
        self.log_zone_change(prev_zone, decision.zone, decision.state, estimate.filtered_angle);

        match decision.transition {
            Some(Transition::Tripped) => self.on_trip(estimate.filtered_angle)?,
            Some(Transition::Recovered) => self.on_recover(estimate.filtered_angle)?,
            None => {}
        }

        let neutral = self.safety.neutral();
        let mut report = TickReport {
            tick: self.tick,
            estimate,
            state: decision.state,
            zone: decision.zone,
            transition: decision.transition,
            command: MotorCommand::STOP,
            target_angle: neutral,
            torque: 0.0,
            differential: 0.0,
            elapsed: Duration::ZERO,
            overrun: false,
        };
        if decision.state == SafetyState::Tripped {
            return Ok(report);
        }

        // Velocity: mean wheel velocity -> tilt target offset.
        if self.enabled[StageId::Velocity.index()]
            && let Some(dt) = self.schedule.poll(StageId::Velocity, at)
        {
            let v = self.read_velocity()?;
            self.velocity = Some(v);
            let out = self.stages[StageId::Velocity.index()].update(v, dt);
            tracing::debug!(stage = "velocity", measurement = v, output = out, dt, "stage");
        }

        // Yaw: yaw rate -> torque differential.
        let differential = if self.enabled[StageId::Yaw.index()] {
            if let Some(dt) = self.schedule.poll(StageId::Yaw, at) {
                let rate = hw(self.tilt.read_angular_rate_yaw(), "reading yaw rate")?;
                let out = self.stages[StageId::Yaw.index()].update(rate, dt);
                tracing::debug!(stage = "yaw", measurement = rate, output = out, dt, "stage");
            }
            self.stages[StageId::Yaw.index()].last_output()
        } else {
            self.open_loop_differential
        };

        // Tilt: target from neutral, offset and velocity output, unless the
        // safety monitor forces neutral.
        let velocity_out = if self.enabled[StageId::Velocity.index()] {
            self.stages[StageId::Velocity.index()].last_output()
        } else {
            0.0
        };
        let target = if decision.force_neutral {
            neutral
        } else {
            neutral + self.target_offset + velocity_out
        };
        self.stages[StageId::Tilt.index()]
            .set_setpoint(target)
            .map_err(eyre::Report::new)
            .wrap_err("setting tilt target")?;
        if let Some(dt) = self.schedule.poll(StageId::Tilt, at) {
            let out = self.stages[StageId::Tilt.index()].update(estimate.filtered_angle, dt);
            tracing::trace!(stage = "tilt", target, output = out, dt, "stage");
        }
        let demand = self.stages[StageId::Tilt.index()].last_output();

        // Torque feedback: correction added to the tilt stage's demand.
        let torque = if self.enabled[StageId::Torque.index()] {
            let stage = &mut self.stages[StageId::Torque.index()];
            stage
                .set_setpoint(demand)
                .map_err(eyre::Report::new)
                .wrap_err("setting torque demand")?;
            if let Some(dt) = self.schedule.poll(StageId::Torque, at) {
                let measured = self.read_torque()?;
                let out = self.stages[StageId::Torque.index()].update(measured, dt);
                tracing::trace!(stage = "torque", demand, measured, output = out, dt, "stage");
            }
            (demand + self.stages[StageId::Torque.index()].last_output()).clamp(-1.0, 1.0)
        } else {
            demand
        };

        let command = mix(torque, differential)
            .map_err(eyre::Report::new)
            .wrap_err("mixing command")?;
        hw(
            self.actuators[LEFT].set_command(command.left),
            "writing left actuator",
        )?;
        hw(
            self.actuators[RIGHT].set_command(command.right),
            "writing right actuator",
        )?;

        report.command = command;
        report.target_angle = target;
        report.torque = torque;
        report.differential = differential;
        Ok(report)
    }

    fn read_velocity(&mut self) -> Result<f32> {
        let Some(positions) = self.positions.as_mut() else {
            return Err(eyre::Report::new(BalanceError::State(
                "velocity stage enabled without position sources".into(),
            )));
        };
        let vl = hw(positions[LEFT].velocity(), "reading left velocity")?;
        let vr = hw(positions[RIGHT].velocity(), "reading right velocity")?;
        let pl = hw(positions[LEFT].position(), "reading left position")?;
        let pr = hw(positions[RIGHT].position(), "reading right position")?;
        if let Some([l0, r0]) = self.last_positions {
            let dl = (pl - l0).unsigned_abs() as f32;
            let dr = (pr - r0).unsigned_abs() as f32;
            self.travel += mean2(dl, dr);
        }
        self.last_positions = Some([pl, pr]);
        Ok(mean2(vl, vr))
    }

    fn read_torque(&mut self) -> Result<f32> {
        let Some(currents) = self.currents.as_mut() else {
            return Err(eyre::Report::new(BalanceError::State(
                "torque stage enabled without current sources".into(),
            )));
        };
        let il = hw(currents[LEFT].read_current(), "reading left current")?;
        let ir = hw(currents[RIGHT].read_current(), "reading right current")?;
        Ok(mean2(il as f32, ir as f32) * self.cfg.calibration.torque_per_current_unit)
    }

    fn on_trip(&mut self, angle: f32) -> Result<()> {
        tracing::error!(
            angle,
            hard_limit = self.cfg.safety.hard_limit,
            trips = self.safety.trips(),
            "safety trip: actuators stopped"
        );
        for s in &mut self.stages {
            s.reset();
        }
        self.schedule.reset();
        let mut first_err = None;
        for a in &mut self.actuators {
            let r = hw(a.set_command(0.0), "zeroing actuator on trip")
                .and_then(|()| hw(a.stop(), "stopping actuator on trip"));
            if let Err(e) = r
                && first_err.is_none()
            {
                first_err = Some(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn on_recover(&mut self, angle: f32) -> Result<()> {
        for a in &mut self.actuators {
            hw(a.start(), "restarting actuator")?;
        }
        for s in &mut self.stages {
            s.reset_derivative();
        }
        tracing::info!(angle, "recovered inside hard limit; actuators restarted");
        Ok(())
    }

    fn start_devices(&mut self) -> Result<()> {
        if let Some(positions) = self.positions.as_mut() {
            for p in positions.iter_mut() {
                hw(p.reset(), "resetting wheel position")?;
            }
        }
        for a in &mut self.actuators {
            hw(a.start(), "starting actuator")?;
            hw(a.set_command(0.0), "zeroing actuator")?;
        }
        Ok(())
    }

    fn emergency_stop(&mut self, cause: &eyre::Report) {
        tracing::error!(error = %cause, "hardware fault: stopping actuators");
        for a in &mut self.actuators {
            if let Err(e) = a.set_command(0.0) {
                tracing::warn!(error = %e, "zeroing actuator failed");
            }
            if let Err(e) = a.stop() {
                tracing::warn!(error = %e, "stopping actuator failed");
            }
        }
        self.started = false;
    }

    fn log_zone_change(&self, prev: SafetyZone, zone: SafetyZone, state: SafetyState, angle: f32) {
        if prev == zone || state == SafetyState::Tripped {
            return;
        }
        match zone {
            SafetyZone::Soft if prev == SafetyZone::Safe => tracing::warn!(
                angle,
                soft_limit = self.cfg.safety.soft_limit,
                "soft limit exceeded: tilt target forced to neutral"
            ),
            SafetyZone::Hard => tracing::warn!(
                angle,
                hard_limit = self.cfg.safety.hard_limit,
                "hard limit exceeded inside grace period"
            ),
            SafetyZone::Safe => tracing::info!(angle, "back inside soft limit"),
            SafetyZone::Soft => {}
        }
    }

    // ── Bookkeeping ──────────────────────────────────────────────────────────

    fn record_timing(&mut self, elapsed: Duration, overrun: bool) {
        let limit = self.cfg.loop_.sustained_overrun_ticks.max(1);
        let was_sustained = self.stats.sustained;
        self.stats.record(elapsed, overrun, limit);
        self.window.record(elapsed, overrun, limit);
        if overrun && self.stats.consecutive_overruns == 1 {
            tracing::warn!(
                tick = self.tick,
                elapsed_us = elapsed.as_micros() as u64,
                period_us = self.period.as_micros() as u64,
                "tick overrun"
            );
        }
        if self.stats.sustained && !was_sustained {
            tracing::warn!(
                consecutive = self.stats.consecutive_overruns,
                "sustained overrun; loop cannot hold its rate"
            );
        }
    }

    fn publish(&self, r: &TickReport) {
        let mut stages = [StageTelemetry::default(); StageId::COUNT];
        for id in StageId::ALL {
            let s = &self.stages[id.index()];
            stages[id.index()] = StageTelemetry {
                enabled: self.enabled[id.index()],
                gains: s.gains(),
                setpoint: s.setpoint(),
                output: s.last_output(),
            };
        }
        self.telemetry.publish(&Telemetry {
            tick: r.tick,
            uptime_us: self.clock.micros_since(self.epoch),
            raw_angle: r.estimate.raw_angle,
            filtered_angle: r.estimate.filtered_angle,
            angular_rate: r.estimate.angular_rate,
            target_angle: r.target_angle,
            target_offset: self.target_offset,
            torque: r.torque,
            differential: r.differential,
            velocity: self.velocity,
            travel: self.travel,
            command: r.command,
            state: r.state,
            zone: r.zone,
            trips: self.safety.trips(),
            overruns: self.stats.overruns,
            consecutive_overruns: self.stats.consecutive_overruns,
            sustained_overrun: self.stats.sustained,
            last_tick_us: r.elapsed.as_micros() as u64,
            stages,
        });
    }

    fn periodic_logs(&mut self, r: &TickReport) {
        if self.status_every > 0 && self.tick % self.status_every == 0 {
            tracing::debug!(
                tick = self.tick,
                raw = r.estimate.raw_angle,
                filtered = r.estimate.filtered_angle,
                setpoint = r.target_angle,
                torque = r.torque,
                left = r.command.left,
                right = r.command.right,
                state = ?r.state,
                "status"
            );
        }
        if self.timing_every > 0 && self.tick % self.timing_every == 0 {
            let w = self.window;
            tracing::info!(
                avg_us = w.avg().as_micros() as u64,
                max_us = w.max.as_micros() as u64,
                overruns = self.stats.overruns,
                budget = w.budget_ratio(self.period),
                "timing"
            );
            if w.max > self.period * 3 / 2 {
                tracing::warn!(
                    max_us = w.max.as_micros() as u64,
                    period_us = self.period.as_micros() as u64,
                    "tick duration exceeds 1.5x period; consider lowering loop.rate_hz"
                );
            }
            self.window = TimingStats::default();
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

/// Builder for `BalanceLoop`. `build()` needs a tilt sensor and both
/// actuators; `try_build()` reports what is missing at runtime instead.
pub struct BalanceLoopBuilder<T, A> {
    tilt: Option<Box<dyn TiltSensor + Send>>,
    actuators: Option<[Box<dyn Actuator + Send>; 2]>,
    positions: Option<[Box<dyn PositionSource + Send>; 2]>,
    currents: Option<[Box<dyn CurrentSource + Send>; 2]>,
    cfg: Option<BalanceCfg>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    _t: PhantomData<T>,
    _a: PhantomData<A>,
}

impl Default for BalanceLoopBuilder<Missing, Missing> {
    fn default() -> Self {
        Self {
            tilt: None,
            actuators: None,
            positions: None,
            currents: None,
            cfg: None,
            clock: None,
            _t: PhantomData,
            _a: PhantomData,
        }
    }
}

impl<T, A> BalanceLoopBuilder<T, A> {
    pub fn with_config(mut self, cfg: BalanceCfg) -> Self {
        self.cfg = Some(cfg);
        self
    }

    /// Left and right wheel position sources (velocity stage).
    pub fn with_position_sources(
        mut self,
        left: impl PositionSource + Send + 'static,
        right: impl PositionSource + Send + 'static,
    ) -> Self {
        self.positions = Some([Box::new(left), Box::new(right)]);
        self
    }

    /// Left and right current sources (torque feedback stage).
    pub fn with_current_sources(
        mut self,
        left: impl CurrentSource + Send + 'static,
        right: impl CurrentSource + Send + 'static,
    ) -> Self {
        self.currents = Some([Box::new(left), Box::new(right)]);
        self
    }

    /// Defaults to `MonotonicClock`.
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn try_build(self) -> Result<BalanceLoop> {
        let tilt = self
            .tilt
            .ok_or_else(|| eyre::Report::new(BuildError::MissingTiltSensor))?;
        let actuators = self
            .actuators
            .ok_or_else(|| eyre::Report::new(BuildError::MissingActuators))?;
        let clock: Arc<dyn Clock + Send + Sync> = match self.clock {
            Some(c) => c,
            None => Arc::new(MonotonicClock::new()),
        };
        build_loop(
            tilt,
            actuators,
            self.positions,
            self.currents,
            self.cfg.unwrap_or_default(),
            clock,
        )
    }
}

impl<A> BalanceLoopBuilder<Missing, A> {
    pub fn with_tilt_sensor(
        self,
        tilt: impl TiltSensor + Send + 'static,
    ) -> BalanceLoopBuilder<Set, A> {
        BalanceLoopBuilder {
            tilt: Some(Box::new(tilt)),
            actuators: self.actuators,
            positions: self.positions,
            currents: self.currents,
            cfg: self.cfg,
            clock: self.clock,
            _t: PhantomData,
            _a: PhantomData,
        }
    }
}

impl<T> BalanceLoopBuilder<T, Missing> {
    pub fn with_actuators(
        self,
        left: impl Actuator + Send + 'static,
        right: impl Actuator + Send + 'static,
    ) -> BalanceLoopBuilder<T, Set> {
        BalanceLoopBuilder {
            tilt: self.tilt,
            actuators: Some([Box::new(left), Box::new(right)]),
            positions: self.positions,
            currents: self.currents,
            cfg: self.cfg,
            clock: self.clock,
            _t: PhantomData,
            _a: PhantomData,
        }
    }
}

impl BalanceLoopBuilder<Set, Set> {
    pub fn build(self) -> Result<BalanceLoop> {
        self.try_build()
    }
}

fn invalid(msg: &'static str) -> eyre::Report {
    eyre::Report::new(BuildError::InvalidConfig(msg))
}

fn validate(cfg: &BalanceCfg) -> Result<()> {
    if cfg.loop_.rate_hz == 0 {
        return Err(invalid("rate_hz must be > 0"));
    }
    if cfg.loop_.sustained_overrun_ticks == 0 {
        return Err(invalid("sustained_overrun_ticks must be >= 1"));
    }
    let s = &cfg.safety;
    if !(s.soft_limit.is_finite() && s.hard_limit.is_finite())
        || !(s.soft_limit > 0.0 && s.soft_limit < s.hard_limit)
    {
        return Err(invalid("safety limits must satisfy 0 < soft < hard"));
    }
    if !s.neutral_angle.is_finite() || s.neutral_angle.abs() >= s.soft_limit {
        return Err(invalid("neutral angle must be inside the soft limit"));
    }
    if !cfg.estimator.mounting_offset.is_finite() {
        return Err(invalid("mounting offset must be finite"));
    }
    match cfg.estimator.mode {
        FusionMode::Direct => {}
        FusionMode::Complementary { alpha } | FusionMode::LowPass { alpha, .. }
            if !(alpha > 0.0 && alpha < 1.0) =>
        {
            return Err(invalid("estimator alpha must be in (0, 1)"));
        }
        FusionMode::LowPass { rate_alpha, .. } if !(0.0..1.0).contains(&rate_alpha) => {
            return Err(invalid("estimator rate_alpha must be in [0, 1)"));
        }
        _ => {}
    }
    if !cfg.stages.tilt.enabled {
        return Err(invalid("tilt stage cannot be disabled"));
    }
    for id in StageId::ALL {
        let st = cfg.stages.get(id);
        if st.divider == 0 {
            return Err(invalid("stage dividers must be >= 1"));
        }
        let g = st.gains;
        if [g.kp, g.ki, g.kd]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(invalid("stage gains must be finite and >= 0"));
        }
        if !st.setpoint.is_finite() {
            return Err(invalid("stage setpoints must be finite"));
        }
    }
    if cfg.stages.get(cfg.stages.innermost()).divider != 1 {
        return Err(invalid("innermost stage must run every tick"));
    }
    if cfg.stages.torque.enabled {
        let k = cfg.calibration.torque_per_current_unit;
        if !k.is_finite() || k == 0.0 {
            return Err(invalid("torque feedback needs a non-zero torque_per_current_unit"));
        }
    }
    let op = &cfg.operator;
    if op.command_queue == 0 {
        return Err(invalid("command_queue must be >= 1"));
    }
    if !(op.max_gain.is_finite() && op.max_gain > 0.0) {
        return Err(invalid("max_gain must be > 0"));
    }
    if !(op.max_target_offset.is_finite() && op.max_target_offset >= 0.0) {
        return Err(invalid("max_target_offset must be >= 0"));
    }
    Ok(())
}

fn build_loop(
    tilt: Box<dyn TiltSensor + Send>,
    actuators: [Box<dyn Actuator + Send>; 2],
    positions: Option<[Box<dyn PositionSource + Send>; 2]>,
    currents: Option<[Box<dyn CurrentSource + Send>; 2]>,
    cfg: BalanceCfg,
    clock: Arc<dyn Clock + Send + Sync>,
) -> Result<BalanceLoop> {
    validate(&cfg)?;
    if cfg.stages.velocity.enabled && positions.is_none() {
        return Err(eyre::Report::new(BuildError::MissingPositionSources));
    }
    if cfg.stages.torque.enabled && currents.is_none() {
        return Err(eyre::Report::new(BuildError::MissingCurrentSources));
    }

    let stage = |id: StageId, action: Action| {
        let c = cfg.stages.get(id);
        PidStage::new(id.name(), c.gains, c.limits, action).with_setpoint(c.setpoint)
    };
    let stages = [
        stage(StageId::Velocity, Action::Direct),
        stage(StageId::Tilt, Action::Reverse),
        stage(StageId::Torque, Action::Direct),
        stage(StageId::Yaw, Action::Direct),
    ];
    let enabled = StageId::ALL.map(|id| cfg.stages.get(id).enabled);

    let rate = cfg.loop_.rate_hz;
    let period = period(rate);
    let (tx, rx) = bounded(cfg.operator.command_queue);
    let telemetry = Arc::new(SnapshotCell::new());
    let bounds = UpdateBounds {
        max_gain: cfg.operator.max_gain,
        max_target_offset: cfg.operator.max_target_offset,
        neutral_angle: cfg.safety.neutral_angle,
    };
    let handle = OperatorHandle::new(tx, Arc::clone(&telemetry), bounds);
    let now = clock.now();

    let lp = BalanceLoop {
        tilt,
        actuators,
        positions,
        currents,
        estimator: AngleEstimator::new(cfg.estimator.mode, cfg.estimator.mounting_offset),
        safety: SafetyMonitor::new(cfg.safety.clone(), now),
        stages,
        enabled,
        schedule: LoopSchedule::new(period, cfg.stages.dividers()),
        rx,
        handle,
        telemetry,
        bounds,
        started: false,
        epoch: now,
        last_sample_at: None,
        tick: 0,
        target_offset: 0.0,
        open_loop_differential: 0.0,
        velocity: None,
        last_positions: None,
        travel: 0.0,
        stats: TimingStats::default(),
        window: TimingStats::default(),
        status_every: ticks_in(cfg.loop_.status_interval, rate),
        timing_every: ticks_in(cfg.loop_.timing_interval, rate),
        period,
        clock,
        cfg,
    };
    lp.publish_idle();
    Ok(lp)
}

impl BalanceLoop {
    /// Seed the snapshot with configured gains and setpoints before the
    /// first tick.
    fn publish_idle(&self) {
        let estimate = TiltEstimate {
            raw_angle: 0.0,
            filtered_angle: 0.0,
            angular_rate: None,
            timestamp: self.epoch,
        };
        self.publish(&TickReport {
            tick: 0,
            estimate,
            state: SafetyState::Running,
            zone: SafetyZone::Safe,
            transition: None,
            command: MotorCommand::STOP,
            target_angle: self.safety.neutral(),
            torque: 0.0,
            differential: 0.0,
            elapsed: Duration::ZERO,
            overrun: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_stats_track_streaks() {
        let mut s = TimingStats::default();
        let ms = Duration::from_millis;
        s.record(ms(2), false, 2);
        s.record(ms(6), true, 2);
        assert!(!s.sustained);
        s.record(ms(7), true, 2);
        assert!(s.sustained);
        assert_eq!(s.consecutive_overruns, 2);
        s.record(ms(1), false, 2);
        assert!(!s.sustained);
        assert_eq!(s.overruns, 2);
        assert_eq!(s.min, ms(1));
        assert_eq!(s.max, ms(7));
        assert_eq!(s.avg(), ms(4));
        assert!((s.budget_ratio(ms(5)) - 0.8).abs() < 1e-6);
    }
}
