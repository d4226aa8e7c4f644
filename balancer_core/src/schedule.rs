//! Multi-rate bookkeeping: one counter divider per stage plus the time of
//! its last run, so every stage gets its own measured `dt`.

use std::time::{Duration, Instant};

use crate::operator::StageId;

/// Fires on the first tick and then every `divider` ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDivider {
    divider: u32,
    counter: u32,
}

impl RateDivider {
    pub fn new(divider: u32) -> Self {
        Self {
            divider: divider.max(1),
            counter: 0,
        }
    }

    /// Advance one tick; true when the stage runs on this tick.
    #[inline]
    pub fn tick(&mut self) -> bool {
        let due = self.counter == 0;
        self.counter += 1;
        if self.counter >= self.divider {
            self.counter = 0;
        }
        due
    }

    pub fn divider(&self) -> u32 {
        self.divider
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }
}

#[derive(Debug, Clone)]
pub struct LoopSchedule {
    period: Duration,
    dividers: [RateDivider; StageId::COUNT],
    last_run: [Option<Instant>; StageId::COUNT],
}

impl LoopSchedule {
    pub fn new(period: Duration, dividers: [u32; StageId::COUNT]) -> Self {
        Self {
            period,
            dividers: dividers.map(RateDivider::new),
            last_run: [None; StageId::COUNT],
        }
    }

    /// Advance `stage`'s divider for this tick. When it is due, returns the
    /// seconds since its previous run (nominal `divider x period` on the
    /// first run) and records `now`.
    pub fn poll(&mut self, stage: StageId, now: Instant) -> Option<f32> {
        let i = stage.index();
        if !self.dividers[i].tick() {
            return None;
        }
        let dt = match self.last_run[i] {
            Some(prev) => now.saturating_duration_since(prev).as_secs_f32(),
            None => self.nominal_interval(stage).as_secs_f32(),
        };
        self.last_run[i] = Some(now);
        Some(dt)
    }

    pub fn nominal_interval(&self, stage: StageId) -> Duration {
        self.period * self.dividers[stage.index()].divider()
    }

    pub fn divider(&self, stage: StageId) -> u32 {
        self.dividers[stage.index()].divider()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Re-phase every stage to fire on the next tick.
    pub fn reset(&mut self) {
        for d in &mut self.dividers {
            d.reset();
        }
        self.last_run = [None; StageId::COUNT];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divider_fires_on_first_and_every_nth_tick() {
        let mut d = RateDivider::new(3);
        let fired: Vec<bool> = (0..7).map(|_| d.tick()).collect();
        assert_eq!(fired, [true, false, false, true, false, false, true]);
    }

    #[test]
    fn zero_divider_means_every_tick() {
        let mut d = RateDivider::new(0);
        assert!((0..5).all(|_| d.tick()));
    }

    #[test]
    fn poll_reports_measured_dt() {
        let period = Duration::from_millis(5);
        let mut s = LoopSchedule::new(period, [2, 1, 1, 1]);
        let t0 = Instant::now();
        let first = s.poll(StageId::Velocity, t0).unwrap();
        assert!((first - 0.01).abs() < 1e-6);
        assert_eq!(s.poll(StageId::Velocity, t0 + period), None);
        // late tick: the measured gap, not the nominal 10 ms
        let dt = s
            .poll(StageId::Velocity, t0 + Duration::from_millis(13))
            .unwrap();
        assert!((dt - 0.013).abs() < 1e-6);
    }
}
