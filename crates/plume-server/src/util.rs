//! Small helpers.

use std::time::{Duration, Instant};

/// A counter that rate-limits based on time intervals.
///
/// Accumulates counts and only signals "ready to log" after the interval
/// passes, so hot-path drops cannot flood the log.
#[derive(Debug)]
pub struct RateLimitedCounter {
    count: u64,
    last_reset: Instant,
    interval: Duration,
}

impl RateLimitedCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            count: 0,
            last_reset: Instant::now(),
            interval,
        }
    }

    /// Increment by N and return Some(total) once the interval has passed.
    /// Resets count and timestamp when returning Some.
    #[inline]
    pub fn increment_by(&mut self, n: u64) -> Option<u64> {
        self.count += n;

        if self.last_reset.elapsed() >= self.interval {
            let count = self.count;
            self.count = 0;
            self.last_reset = Instant::now();
            Some(count)
        } else {
            None
        }
    }

    #[inline]
    pub fn increment(&mut self) -> Option<u64> {
        self.increment_by(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_within_interval() {
        let mut counter = RateLimitedCounter::new(Duration::from_secs(10));
        assert!(counter.increment().is_none());
        assert!(counter.increment_by(4).is_none());
    }

    #[test]
    fn test_fires_after_interval() {
        let mut counter = RateLimitedCounter::new(Duration::ZERO);
        assert_eq!(counter.increment_by(3), Some(3));
        assert_eq!(counter.increment(), Some(1));
    }
}
