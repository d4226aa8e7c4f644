//! PID stage shared by every loop of the cascade.
//!
//! One owned struct per stage; gains, setpoint and output limits change only
//! through validating setters, so a stage never holds a half-applied update.
//!
//! Anti-windup: the integral is not accumulated while the unclamped output
//! already sits beyond a limit in the direction of the error.

use crate::error::BalanceError;

/// Proportional, integral and derivative gains. Updated as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl PidGains {
    pub const fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self { kp, ki, kd }
    }

    /// Finite and within `[0, max_gain]`.
    pub fn check(&self, max_gain: f32) -> Result<(), BalanceError> {
        for (name, v) in [("kp", self.kp), ("ki", self.ki), ("kd", self.kd)] {
            if !v.is_finite() {
                return Err(BalanceError::InvalidConfigurationUpdate(format!(
                    "{name} must be finite, got {v}"
                )));
            }
            if !(0.0..=max_gain).contains(&v) {
                return Err(BalanceError::InvalidConfigurationUpdate(format!(
                    "{name} = {v} outside [0, {max_gain}]"
                )));
            }
        }
        Ok(())
    }
}

/// Inclusive output clamp, `min < max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputLimits {
    min: f32,
    max: f32,
}

impl OutputLimits {
    /// `[-1, 1]`, the normalised actuator range.
    pub const UNIT: OutputLimits = OutputLimits {
        min: -1.0,
        max: 1.0,
    };

    pub fn new(min: f32, max: f32) -> Result<Self, BalanceError> {
        if !(min.is_finite() && max.is_finite()) || min >= max {
            return Err(BalanceError::InvalidConfigurationUpdate(format!(
                "output limits must be finite with min < max, got ({min}, {max})"
            )));
        }
        Ok(Self { min, max })
    }

    /// `[-limit, limit]`; `limit` must be finite and > 0.
    pub fn symmetric(limit: f32) -> Result<Self, BalanceError> {
        Self::new(-limit, limit)
    }

    #[inline]
    pub fn min(&self) -> f32 {
        self.min
    }

    #[inline]
    pub fn max(&self) -> f32 {
        self.max
    }

    #[inline]
    pub fn clamp(&self, v: f32) -> f32 {
        v.clamp(self.min, self.max)
    }
}

/// Error polarity.
///
/// `Direct`: error = setpoint - measurement.
/// `Reverse`: error = measurement - setpoint, for plants where a positive
/// output must answer a measurement above the setpoint (tilt -> torque).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Direct,
    Reverse,
}

#[derive(Debug, Clone)]
pub struct PidStage {
    name: &'static str,
    gains: PidGains,
    setpoint: f32,
    limits: OutputLimits,
    action: Action,
    integral: f32,
    prev_error: Option<f32>,
    last_output: f32,
}

impl PidStage {
    pub fn new(name: &'static str, gains: PidGains, limits: OutputLimits, action: Action) -> Self {
        Self {
            name,
            gains,
            setpoint: 0.0,
            limits,
            action,
            integral: 0.0,
            prev_error: None,
            last_output: 0.0,
        }
    }

    pub fn with_setpoint(mut self, setpoint: f32) -> Self {
        if setpoint.is_finite() {
            self.setpoint = setpoint;
        }
        self
    }

    /// One evaluation. `dt` is the measured time since this stage last ran;
    /// a non-positive or non-finite `dt` skips the integral and derivative
    /// terms. A non-finite measurement leaves the state untouched and
    /// returns the previous output.
    pub fn update(&mut self, measurement: f32, dt: f32) -> f32 {
        if !measurement.is_finite() {
            tracing::warn!(stage = self.name, "non-finite measurement ignored");
            return self.last_output;
        }
        let error = match self.action {
            Action::Direct => self.setpoint - measurement,
            Action::Reverse => measurement - self.setpoint,
        };
        let dt_ok = dt.is_finite() && dt > 0.0;
        let PidGains { kp, ki, kd } = self.gains;

        let p = kp * error;
        let d = match self.prev_error {
            Some(prev) if dt_ok => kd * (error - prev) / dt,
            _ => 0.0,
        };

        if dt_ok {
            let unclamped = p + ki * self.integral + d;
            let winding_up = (unclamped > self.limits.max && error > 0.0)
                || (unclamped < self.limits.min && error < 0.0);
            let candidate = self.integral + error * dt;
            if !winding_up && candidate.is_finite() {
                self.integral = candidate;
            }
        }
        self.prev_error = Some(error);

        let raw = p + ki * self.integral + d;
        let out = if raw.is_nan() {
            self.last_output
        } else {
            self.limits.clamp(raw)
        };
        self.last_output = out;
        out
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    /// Replace all three gains at once; rejects non-finite or negative values.
    pub fn set_gains(&mut self, gains: PidGains) -> Result<(), BalanceError> {
        gains.check(f32::MAX)?;
        self.gains = gains;
        Ok(())
    }

    pub fn setpoint(&self) -> f32 {
        self.setpoint
    }

    pub fn set_setpoint(&mut self, value: f32) -> Result<(), BalanceError> {
        if !value.is_finite() {
            return Err(BalanceError::InvalidConfigurationUpdate(format!(
                "{} setpoint must be finite, got {value}",
                self.name
            )));
        }
        self.setpoint = value;
        Ok(())
    }

    pub fn limits(&self) -> OutputLimits {
        self.limits
    }

    /// New clamp; the held output is re-clamped.
    pub fn set_output_limits(&mut self, limits: OutputLimits) {
        self.limits = limits;
        self.last_output = limits.clamp(self.last_output);
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn last_output(&self) -> f32 {
        self.last_output
    }

    /// Clear integral, derivative history and held output.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
        self.last_output = 0.0;
    }

    /// Forget the previous error so the next derivative term is zero.
    pub fn reset_derivative(&mut self) {
        self.prev_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(kp: f32, ki: f32, kd: f32) -> PidStage {
        PidStage::new(
            "test",
            PidGains::new(kp, ki, kd),
            OutputLimits::symmetric(1.0).unwrap(),
            Action::Direct,
        )
    }

    #[test]
    fn proportional_only() {
        let mut s = stage(0.5, 0.0, 0.0).with_setpoint(1.0);
        assert_eq!(s.update(0.0, 0.01), 0.5);
        assert_eq!(s.update(2.0, 0.01), -0.5);
    }

    #[test]
    fn reverse_action_flips_error() {
        let mut s = PidStage::new(
            "tilt",
            PidGains::new(0.1, 0.0, 0.0),
            OutputLimits::symmetric(1.0).unwrap(),
            Action::Reverse,
        );
        // measurement above setpoint => positive output
        assert!((s.update(5.0, 0.01) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn first_update_has_no_derivative_kick() {
        let mut s = stage(0.0, 0.0, 1.0).with_setpoint(1.0);
        assert_eq!(s.update(0.0, 0.01), 0.0);
        // error 1 -> 0.5 over 0.01 s => derivative -50, clamped to -1
        assert_eq!(s.update(0.5, 0.01), -1.0);
    }

    #[test]
    fn integral_accumulates_with_measured_dt() {
        let mut s = stage(0.0, 1.0, 0.0).with_setpoint(0.1);
        s.update(0.0, 0.5);
        s.update(0.0, 1.5);
        assert!((s.integral() - 0.2).abs() < 1e-6);
        assert!((s.last_output() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn zero_dt_skips_integral_and_derivative() {
        let mut s = stage(0.0, 1.0, 1.0).with_setpoint(1.0);
        s.update(0.0, 0.1);
        let before = s.integral();
        let out = s.update(0.5, 0.0);
        assert_eq!(s.integral(), before);
        assert!((out - before).abs() < 1e-6);
    }

    #[test]
    fn anti_windup_stops_accumulating_while_saturated() {
        let mut s = stage(2.0, 1.0, 0.0).with_setpoint(10.0);
        for _ in 0..100 {
            assert_eq!(s.update(0.0, 0.1), 1.0);
        }
        // P alone saturates, so the integral never grew
        assert_eq!(s.integral(), 0.0);
        // and the loop unwinds as soon as the error reverses
        s.set_setpoint(0.0).unwrap();
        assert!(s.update(1.0, 0.1) < 0.0);
    }

    #[test]
    fn integral_may_unwind_while_saturated_in_the_other_direction() {
        let mut s = stage(0.0, 1.0, 0.0).with_setpoint(1.0);
        for _ in 0..5 {
            s.update(0.0, 0.1);
        }
        let wound = s.integral();
        assert!(wound > 0.0);
        s.set_setpoint(-100.0).unwrap();
        s.update(0.0, 0.1);
        assert!(s.integral() < wound);
    }

    #[test]
    fn setters_reject_non_finite_and_keep_previous() {
        let mut s = stage(0.1, 0.2, 0.3).with_setpoint(2.0);
        assert!(s.set_setpoint(f32::NAN).is_err());
        assert_eq!(s.setpoint(), 2.0);
        assert!(s.set_gains(PidGains::new(1.0, f32::INFINITY, 0.0)).is_err());
        assert_eq!(s.gains(), PidGains::new(0.1, 0.2, 0.3));
        assert!(s.set_gains(PidGains::new(-1.0, 0.0, 0.0)).is_err());
        s.set_gains(PidGains::new(1.0, 0.0, 0.0)).unwrap();
        assert_eq!(s.gains().kp, 1.0);
    }

    #[test]
    fn non_finite_measurement_returns_previous_output() {
        let mut s = stage(0.5, 0.0, 0.0).with_setpoint(1.0);
        let first = s.update(0.0, 0.01);
        assert_eq!(s.update(f32::NAN, 0.01), first);
    }

    #[test]
    fn reset_clears_history() {
        let mut s = stage(0.0, 1.0, 1.0).with_setpoint(1.0);
        s.update(0.0, 0.1);
        s.reset();
        assert_eq!(s.integral(), 0.0);
        assert_eq!(s.last_output(), 0.0);
        // no derivative kick after reset
        assert_eq!(s.update(0.0, 0.1), 0.1);
    }

    #[test]
    fn limits_reject_inverted_ranges() {
        assert!(OutputLimits::new(1.0, -1.0).is_err());
        assert!(OutputLimits::new(0.0, 0.0).is_err());
        assert!(OutputLimits::symmetric(f32::NAN).is_err());
    }
}
