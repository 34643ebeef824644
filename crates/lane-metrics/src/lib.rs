//! # lane-metrics
//!
//! Lightweight request-rate instrumentation for inferlane: bucketed
//! per-second counters and trailing-window moving averages. The epoch
//! scheduler drives its reallocation decisions from these.

pub mod average;
pub mod counter;

pub use average::MovingAverage;
pub use counter::IntervalCounter;
