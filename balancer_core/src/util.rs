//! Common time/period helpers and a lock-free f32 cell.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Number of microseconds in one second.
pub const MICROS_PER_SEC: u64 = 1_000_000;

/// Compute the period in microseconds for a given rate in Hz.
/// - Clamps `hz` to at least 1 to avoid division by zero.
/// - Ensures result is at least 1 microsecond.
#[inline]
pub fn period_us(hz: u32) -> u64 {
    (MICROS_PER_SEC / u64::from(hz.max(1))).max(1)
}

#[inline]
pub fn period(hz: u32) -> Duration {
    Duration::from_micros(period_us(hz))
}

/// Number of ticks covering `interval` at `hz`; 0 stays 0 (disabled).
#[inline]
pub fn ticks_in(interval: Duration, hz: u32) -> u64 {
    if interval.is_zero() {
        return 0;
    }
    let per = period_us(hz);
    let us = u64::try_from(interval.as_micros()).unwrap_or(u64::MAX);
    us.div_ceil(per).max(1)
}

#[inline]
pub fn mean2(a: f32, b: f32) -> f32 {
    0.5 * (a + b)
}

/// f32 stored as bits in an `AtomicU32`.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(v: f32) -> Self {
        Self(AtomicU32::new(v.to_bits()))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> f32 {
        f32::from_bits(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, v: f32, order: Ordering) {
        self.0.store(v.to_bits(), order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_helpers() {
        assert_eq!(period_us(200), 5_000);
        assert_eq!(period_us(0), 1_000_000);
        assert_eq!(period(1_000), Duration::from_millis(1));
        assert_eq!(ticks_in(Duration::from_millis(250), 200), 50);
        assert_eq!(ticks_in(Duration::from_millis(1), 200), 1);
        assert_eq!(ticks_in(Duration::ZERO, 200), 0);
    }

    #[test]
    fn atomic_f32_round_trips_bits() {
        let a = AtomicF32::new(-1.5);
        assert_eq!(a.load(Ordering::Relaxed), -1.5);
        a.store(f32::NAN, Ordering::Relaxed);
        assert!(a.load(Ordering::Relaxed).is_nan());
    }
}
