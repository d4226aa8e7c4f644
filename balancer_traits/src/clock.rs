use std::thread;
use std::time::{Duration, Instant};

/// Monotonic time source for the control loop and simulated plant.
///
/// - now(): monotonic Instant
/// - sleep(): pace the caller; simulated clocks advance instead of blocking
/// - micros_since()/secs_since(): elapsed helpers that saturate at zero
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);

    /// Microseconds elapsed since `epoch`, saturating at 0 on underflow.
    fn micros_since(&self, epoch: Instant) -> u64 {
        let dur = self.now().saturating_duration_since(epoch);
        u64::try_from(dur.as_micros()).unwrap_or(u64::MAX)
    }

    /// Seconds elapsed since `epoch` as f32, saturating at 0.
    fn secs_since(&self, epoch: Instant) -> f32 {
        self.now().saturating_duration_since(epoch).as_secs_f32()
    }
}

/// Wall-clock monotonic time backed by std::time::Instant.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
    fn sleep(&self, d: Duration) {
        (**self).sleep(d)
    }
}

pub mod test_clock {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Deterministic clock whose time only moves when told to.
    ///
    /// now() = origin + offset
    /// sleep(d) advances the offset by d without blocking.
    ///
    /// Clones share the same offset, so a plant simulation and the control
    /// loop can observe one timeline.
    #[derive(Debug, Clone)]
    pub struct TestClock {
        origin: Instant,
        offset_ns: Arc<AtomicU64>,
    }

    impl Default for TestClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestClock {
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
                offset_ns: Arc::new(AtomicU64::new(0)),
            }
        }

        /// Advance the clock by the given duration.
        pub fn advance(&self, d: Duration) {
            let ns = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
            self.offset_ns.fetch_add(ns, Ordering::SeqCst);
        }

        /// Set the absolute offset relative to origin.
        pub fn set_offset(&self, d: Duration) {
            let ns = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
            self.offset_ns.store(ns, Ordering::SeqCst);
        }

        /// Current offset from the origin.
        pub fn offset(&self) -> Duration {
            Duration::from_nanos(self.offset_ns.load(Ordering::SeqCst))
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.origin + self.offset()
        }

        fn sleep(&self, d: Duration) {
            self.advance(d);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_clock::TestClock;
    use super::*;

    #[test]
    fn test_clock_sleep_advances_without_blocking() {
        let clock = TestClock::new();
        let t0 = clock.now();
        clock.sleep(Duration::from_secs(3600));
        assert_eq!(clock.micros_since(t0), 3_600_000_000);
    }

    #[test]
    fn clones_share_one_timeline() {
        let a = TestClock::new();
        let b = a.clone();
        let t0 = a.now();
        b.advance(Duration::from_millis(5));
        assert_eq!(a.micros_since(t0), 5_000);
        assert!((a.secs_since(t0) - 0.005).abs() < 1e-6);
    }

    #[test]
    fn elapsed_saturates_for_future_epoch() {
        let clock = TestClock::new();
        clock.set_offset(Duration::from_millis(10));
        let later = clock.now();
        clock.set_offset(Duration::ZERO);
        assert_eq!(clock.micros_since(later), 0);
        assert_eq!(clock.secs_since(later), 0.0);
    }
}
