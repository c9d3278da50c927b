//! Clock oracle used to timestamp writes.
//!
//! Timestamps are i64 nanoseconds. A clock never goes backwards.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of monotonically non-decreasing write timestamps.
pub trait Clock: Send + Sync {
    fn continuous_time(&self) -> i64;
}

/// Wall-clock nanoseconds, forced strictly increasing within the process.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Wall-clock nanoseconds since the epoch. Used for activity bookkeeping,
/// never for write timestamps.
pub fn wall_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}

impl Clock for SystemClock {
    fn continuous_time(&self) -> i64 {
        let wall = wall_nanos();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

/// Counter clock for deterministic tests: every reading is one tick later.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Jump forward without producing a reading.
    pub fn advance(&self, by: i64) {
        self.now.fetch_add(by, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn continuous_time(&self) -> i64 {
        self.now.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_strictly_increases() {
        let clock = SystemClock::new();
        let mut last = clock.continuous_time();
        for _ in 0..1000 {
            let next = clock.continuous_time();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_manual_clock_ticks() {
        let clock = ManualClock::starting_at(10);
        assert_eq!(clock.continuous_time(), 11);
        clock.advance(100);
        assert_eq!(clock.continuous_time(), 112);
    }
}
