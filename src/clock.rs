//! Monotonic millisecond clock abstraction.
//!
//! Recovered from `Cache::time_ms()` in
//! `original_source/server/modules/filter/cache/cache.hh`: every TTL
//! computation in this crate goes through one clock rather than calling
//! `Instant::now()` directly, so tests can supply deterministic time
//! (spec §8's TTL boundary scenarios need exact millisecond control) while
//! a real deployment just wraps the system monotonic clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary but fixed epoch for this clock
    /// instance. Only differences between two calls are meaningful.
    fn now_ms(&self) -> u64;
}

/// The clock a real binary uses: milliseconds since the clock was
/// created, backed by [`Instant`].
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// A clock tests can move forward explicitly, so TTL boundary scenarios
/// (spec §8 S3) are exact instead of racing real wall-clock time.
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock { millis: AtomicU64::new(0) }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_deterministically() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance(1500);
        assert_eq!(clock.now_ms(), 1500);
        clock.set(9999);
        assert_eq!(clock.now_ms(), 9999);
    }

    #[test]
    fn system_clock_is_monotonic_nondecreasing() {
        let clock = SystemClock::new();
        let a = clock.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
