//! Monotonic time source used to stamp enqueue times and compute re-arm deadlines.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Source of monotonic time points.
///
/// Implementations must never go backwards. The scheduler only reads the clock; it never sleeps
/// on it, so a [`ManualClock`] only changes the timestamps tasks carry, not how long threads wait.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Intended for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    /// Start the clock at the current instant.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `step`.
    pub fn advance(&self, step: Duration) {
        let mut now = self.now.lock();
        *now += step;
    }

    /// Jump to `instant`. Earlier instants are ignored so the clock stays monotonic.
    pub fn set(&self, instant: Instant) {
        let mut now = self.now.lock();
        if instant > *now {
            *now = instant;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances_only_on_request() {
        let start = Instant::now();
        let clock = ManualClock::starting_at(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now(), start + Duration::from_millis(5));
    }

    #[test]
    fn manual_clock_never_goes_backwards() {
        let start = Instant::now();
        let clock = ManualClock::starting_at(start + Duration::from_secs(1));
        clock.set(start);
        assert_eq!(clock.now(), start + Duration::from_secs(1));

        clock.set(start + Duration::from_secs(2));
        assert_eq!(clock.now(), start + Duration::from_secs(2));
    }
}
