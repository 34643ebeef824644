//! Trailing-window moving average over bucket counts

use std::collections::VecDeque;
use std::time::Duration;

/// Absorbs per-bucket event counts and reports the mean event rate over a
/// trailing window.
///
/// The rate is negative until a full window of samples has been seeded, so
/// callers can tell "no traffic yet" from "measured zero traffic".
#[derive(Debug)]
pub struct MovingAverage {
    bucket_secs: f64,
    window_buckets: usize,
    samples: VecDeque<f64>,
}

impl MovingAverage {
    /// Create an average over `window` using buckets of width `bucket`
    pub fn new(bucket: Duration, window: Duration) -> Self {
        assert!(!bucket.is_zero(), "bucket width must be positive");
        assert!(window >= bucket, "window must cover at least one bucket");
        let window_buckets =
            (window.as_secs_f64() / bucket.as_secs_f64()).ceil() as usize;
        Self {
            bucket_secs: bucket.as_secs_f64(),
            window_buckets,
            samples: VecDeque::with_capacity(window_buckets),
        }
    }

    /// Absorb one bucket's event count
    pub fn add_sample(&mut self, count: u64) {
        if self.samples.len() == self.window_buckets {
            self.samples.pop_front();
        }
        self.samples.push_back(count as f64 / self.bucket_secs);
    }

    /// Mean rate in events per second over the trailing window, or -1.0
    /// until the window is seeded
    pub fn rate(&self) -> f64 {
        if self.samples.len() < self.window_buckets {
            return -1.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Number of samples absorbed so far, capped at the window size
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples have been absorbed yet
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
