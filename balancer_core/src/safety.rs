//! Safety Monitor: two-threshold tilt envelope.
//!
//! Zones by `|filtered_angle|`:
//! - SAFE `<= soft`: full tracking
//! - SOFT `(soft, hard]`: tilt target forced to neutral, actuators live
//! - HARD `> hard`: trip once the grace period since start / last trip is over
//!
//! The monitor only decides. The scheduler performs the side effects of a
//! transition (stop or restart actuators, reset integrators).

use std::time::{Duration, Instant};

use crate::config::SafetyCfg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafetyState {
    #[default]
    Running,
    Tripped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafetyZone {
    #[default]
    Safe,
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Tripped,
    Recovered,
}

/// Outcome of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyDecision {
    pub state: SafetyState,
    pub zone: SafetyZone,
    /// Set on the observation that changed `state`.
    pub transition: Option<Transition>,
    /// Tilt target must be neutral this tick.
    pub force_neutral: bool,
}

#[derive(Debug, Clone)]
pub struct SafetyMonitor {
    cfg: SafetyCfg,
    state: SafetyState,
    zone: SafetyZone,
    since: Instant,
    trips: u64,
}

impl SafetyMonitor {
    /// Starts RUNNING; the grace period counts from `start`.
    pub fn new(cfg: SafetyCfg, start: Instant) -> Self {
        Self {
            cfg,
            state: SafetyState::Running,
            zone: SafetyZone::Safe,
            since: start,
            trips: 0,
        }
    }

    pub fn zone_of(&self, angle: f32) -> SafetyZone {
        let a = angle.abs();
        if a > self.cfg.hard_limit {
            SafetyZone::Hard
        } else if a > self.cfg.soft_limit {
            SafetyZone::Soft
        } else {
            SafetyZone::Safe
        }
    }

    pub fn observe(&mut self, angle: f32, now: Instant) -> SafetyDecision {
        let zone = self.zone_of(angle);
        self.zone = zone;
        let mut transition = None;

        match self.state {
            SafetyState::Running => {
                let elapsed = now.saturating_duration_since(self.since);
                if zone == SafetyZone::Hard && elapsed > self.cfg.grace_period {
                    self.state = SafetyState::Tripped;
                    self.since = now;
                    self.trips += 1;
                    transition = Some(Transition::Tripped);
                }
            }
            SafetyState::Tripped => {
                if zone != SafetyZone::Hard {
                    self.state = SafetyState::Running;
                    transition = Some(Transition::Recovered);
                }
            }
        }

        SafetyDecision {
            state: self.state,
            zone,
            transition,
            force_neutral: zone != SafetyZone::Safe,
        }
    }

    /// Back to RUNNING with a fresh grace period.
    pub fn reset(&mut self, now: Instant) {
        self.state = SafetyState::Running;
        self.zone = SafetyZone::Safe;
        self.since = now;
    }

    pub fn state(&self) -> SafetyState {
        self.state
    }

    pub fn zone(&self) -> SafetyZone {
        self.zone
    }

    pub fn trips(&self) -> u64 {
        self.trips
    }

    pub fn grace_period(&self) -> Duration {
        self.cfg.grace_period
    }

    pub fn neutral(&self) -> f32 {
        self.cfg.neutral_angle
    }
}
