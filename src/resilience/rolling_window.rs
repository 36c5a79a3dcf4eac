//! Bucketed rolling statistics for circuit breakers.
//!
//! The window is split into `buckets` equal slices. Outcomes land in the
//! newest slice; slices older than the window fall off the front. Totals are
//! the sum of the live slices, so counters only drop on rollover (or an
//! explicit reset).

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Counters tracked per bucket and reported as window totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub fires: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejects: u64,
    pub fallbacks: u64,
}

impl BreakerStats {
    fn absorb(&mut self, other: &BreakerStats) {
        self.fires += other.fires;
        self.successes += other.successes;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
        self.rejects += other.rejects;
        self.fallbacks += other.fallbacks;
    }

    /// Failure percentage over fires (0.0 when idle).
    pub fn error_rate(&self) -> f64 {
        if self.fires == 0 {
            0.0
        } else {
            self.failures as f64 / self.fires as f64 * 100.0
        }
    }
}

/// Something that happened to a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Fire,
    Success,
    Failure,
    Timeout,
    Reject,
    Fallback,
}

#[derive(Debug)]
pub struct RollingWindow {
    buckets: VecDeque<BreakerStats>,
    bucket_len: Duration,
    bucket_count: usize,
    current_started: Instant,
}

impl RollingWindow {
    pub fn new(window: Duration, buckets: u32, now: Instant) -> Self {
        let bucket_count = buckets.max(1) as usize;
        let bucket_len = (window / bucket_count as u32).max(Duration::from_millis(1));

        let mut deque = VecDeque::with_capacity(bucket_count);
        deque.push_back(BreakerStats::default());

        Self {
            buckets: deque,
            bucket_len,
            bucket_count,
            current_started: now,
        }
    }

    fn rotate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.current_started);
        let bucket_nanos = self.bucket_len.as_nanos();
        let steps = elapsed.as_nanos() / bucket_nanos;
        if steps == 0 {
            return;
        }

        if steps >= self.bucket_count as u128 {
            // Whole window elapsed: start over, aligned to bucket boundaries.
            self.buckets.clear();
            self.buckets.push_back(BreakerStats::default());
            let remainder = (elapsed.as_nanos() % bucket_nanos) as u64;
            self.current_started = now - Duration::from_nanos(remainder);
            return;
        }

        for _ in 0..steps {
            self.buckets.push_back(BreakerStats::default());
            if self.buckets.len() > self.bucket_count {
                self.buckets.pop_front();
            }
        }
        self.current_started += self.bucket_len * steps as u32;
    }

    pub fn record(&mut self, outcome: Outcome, now: Instant) {
        self.rotate(now);
        let Some(bucket) = self.buckets.back_mut() else {
            return;
        };
        match outcome {
            Outcome::Fire => bucket.fires += 1,
            Outcome::Success => bucket.successes += 1,
            Outcome::Failure => bucket.failures += 1,
            Outcome::Timeout => bucket.timeouts += 1,
            Outcome::Reject => bucket.rejects += 1,
            Outcome::Fallback => bucket.fallbacks += 1,
        }
    }

    pub fn totals(&mut self, now: Instant) -> BreakerStats {
        self.rotate(now);
        let mut totals = BreakerStats::default();
        for bucket in &self.buckets {
            totals.absorb(bucket);
        }
        totals
    }

    pub fn reset(&mut self, now: Instant) {
        self.buckets.clear();
        self.buckets.push_back(BreakerStats::default());
        self.current_started = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_counts_accumulate_within_window() {
        let t0 = Instant::now();
        let mut w = RollingWindow::new(ms(1000), 10, t0);

        w.record(Outcome::Fire, t0);
        w.record(Outcome::Failure, t0 + ms(150));
        w.record(Outcome::Fire, t0 + ms(420));
        w.record(Outcome::Success, t0 + ms(999));

        let totals = w.totals(t0 + ms(999));
        assert_eq!(totals.fires, 2);
        assert_eq!(totals.failures, 1);
        assert_eq!(totals.successes, 1);
        assert_eq!(totals.error_rate(), 50.0);
    }

    #[test]
    fn test_old_buckets_roll_off() {
        let t0 = Instant::now();
        let mut w = RollingWindow::new(ms(1000), 10, t0);

        w.record(Outcome::Failure, t0);
        w.record(Outcome::Failure, t0 + ms(500));

        // First bucket has left the window, the second has not.
        assert_eq!(w.totals(t0 + ms(1050)).failures, 1);
        // Both gone.
        assert_eq!(w.totals(t0 + ms(1600)).failures, 0);
    }

    #[test]
    fn test_long_idle_clears_everything() {
        let t0 = Instant::now();
        let mut w = RollingWindow::new(ms(100), 4, t0);
        w.record(Outcome::Fire, t0);
        w.record(Outcome::Reject, t0);

        assert_eq!(w.totals(t0 + ms(10_000)), BreakerStats::default());

        w.record(Outcome::Fire, t0 + ms(10_010));
        assert_eq!(w.totals(t0 + ms(10_010)).fires, 1);
    }

    #[test]
    fn test_reset() {
        let t0 = Instant::now();
        let mut w = RollingWindow::new(ms(1000), 10, t0);
        w.record(Outcome::Fire, t0);
        w.reset(t0 + ms(10));
        assert_eq!(w.totals(t0 + ms(10)).fires, 0);
    }

    #[test]
    fn test_error_rate_idle() {
        assert_eq!(BreakerStats::default().error_rate(), 0.0);
    }
}
