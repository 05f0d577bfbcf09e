//! Pluggable wall-clock time source.
//!
//! Window arithmetic in the rate limiter is driven by wall-clock time so that
//! independent processes agree on window boundaries. The trait exists so tests
//! can step time deterministically instead of sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock time, expressed as nanoseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current time as nanoseconds since the Unix epoch.
    fn now_unix_nanos(&self) -> i64;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_nanos(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }
}

/// A manually driven clock for tests.
///
/// Starts at an arbitrary instant and only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    /// Create a clock pinned at the given instant.
    pub fn new(start_unix_nanos: i64) -> Self {
        Self {
            nanos: AtomicI64::new(start_unix_nanos),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.nanos.fetch_add(delta.as_nanos() as i64, Ordering::SeqCst);
    }

    /// Pin the clock at an absolute instant.
    pub fn set(&self, unix_nanos: i64) {
        self.nanos.store(unix_nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_unix_nanos(), 1_000);

        clock.advance(Duration::from_nanos(500));
        assert_eq!(clock.now_unix_nanos(), 1_500);

        clock.set(42);
        assert_eq!(clock.now_unix_nanos(), 42);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_unix_nanos();
        let b = clock.now_unix_nanos();
        assert!(a > 0);
        assert!(b >= a);
    }
}
