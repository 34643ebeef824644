//! Bucketed interval counter
//!
//! Counts events into fixed-width time buckets. Completed buckets queue up
//! until the owner drains them with [`IntervalCounter::history`], which is
//! how per-session request counts reach the scheduler once per beacon.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Upper bound on undrained completed buckets. An idle owner that never
/// drains must not grow memory without bound.
const MAX_PENDING_BUCKETS: usize = 600;

/// Counts samples into fixed-width buckets of wall-clock time
#[derive(Debug)]
pub struct IntervalCounter {
    bucket: Duration,
    bucket_start: Instant,
    current: u64,
    completed: VecDeque<u64>,
}

impl IntervalCounter {
    /// Create a counter with the given bucket width
    pub fn new(bucket: Duration) -> Self {
        assert!(!bucket.is_zero(), "bucket width must be positive");
        Self {
            bucket,
            bucket_start: Instant::now(),
            current: 0,
            completed: VecDeque::new(),
        }
    }

    /// The configured bucket width
    pub fn bucket(&self) -> Duration {
        self.bucket
    }

    /// Count `n` events into the current bucket
    pub fn add(&mut self, n: u64) {
        self.add_at(n, Instant::now());
    }

    /// Drain the completed buckets, oldest first. The current (incomplete)
    /// bucket is not included.
    pub fn history(&mut self) -> Vec<u64> {
        self.history_at(Instant::now())
    }

    fn add_at(&mut self, n: u64, now: Instant) {
        self.roll(now);
        self.current += n;
    }

    fn history_at(&mut self, now: Instant) -> Vec<u64> {
        self.roll(now);
        self.completed.drain(..).collect()
    }

    /// Close out every bucket whose window has fully elapsed
    fn roll(&mut self, now: Instant) {
        while now.duration_since(self.bucket_start) >= self.bucket {
            self.completed.push_back(self.current);
            self.current = 0;
            self.bucket_start += self.bucket;
            if self.completed.len() > MAX_PENDING_BUCKETS {
                self.completed.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_accumulate_in_current_bucket() {
        let start = Instant::now();
        let mut counter = IntervalCounter::new(Duration::from_secs(1));
        counter.add_at(3, start);
        counter.add_at(2, start + Duration::from_millis(500));
        // Bucket has not closed yet
        assert!(counter.history_at(start + Duration::from_millis(900)).is_empty());
        // After the bucket closes, the 5 samples drain
        assert_eq!(counter.history_at(start + Duration::from_millis(1100)), vec![5]);
    }

    #[test]
    fn test_idle_buckets_drain_as_zeros() {
        let start = Instant::now();
        let mut counter = IntervalCounter::new(Duration::from_secs(1));
        counter.add_at(1, start);
        let history = counter.history_at(start + Duration::from_millis(3500));
        assert_eq!(history, vec![1, 0, 0]);
    }

    #[test]
    fn test_history_drains_once() {
        let start = Instant::now();
        let mut counter = IntervalCounter::new(Duration::from_secs(1));
        counter.add_at(4, start);
        let now = start + Duration::from_millis(1200);
        assert_eq!(counter.history_at(now), vec![4]);
        assert!(counter.history_at(now).is_empty());
    }

    #[test]
    fn test_samples_land_in_their_own_buckets() {
        let start = Instant::now();
        let mut counter = IntervalCounter::new(Duration::from_secs(1));
        counter.add_at(1, start);
        counter.add_at(2, start + Duration::from_millis(1100));
        counter.add_at(3, start + Duration::from_millis(2200));
        assert_eq!(counter.history_at(start + Duration::from_millis(3100)), vec![1, 2, 3]);
    }

    #[test]
    fn test_pending_buckets_are_bounded() {
        let start = Instant::now();
        let mut counter = IntervalCounter::new(Duration::from_millis(10));
        let much_later = start + Duration::from_secs(60);
        let history = counter.history_at(much_later);
        assert!(history.len() <= MAX_PENDING_BUCKETS);
    }
}
