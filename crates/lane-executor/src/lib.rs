//! # lane-executor
//!
//! The per-backend GPU executor's plan follower. Each backend owns one GPU
//! and runs one follower: a single event-loop task that orders incoming
//! batch plans by execution time, arms a timer to the earliest one, and
//! hands due plans to the inference engine.
//!
//! The engine itself is behind the [`ModelExecutor`] seam: given a batch,
//! it produces results before the provided deadline with known forward
//! latency, and emits those results through its own path.

use thiserror::Error;

pub mod follower;

pub use follower::{FollowerStats, ModelExecutor, PlanFollower};

/// Result type for executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that can occur in the plan follower
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Follower already started")]
    AlreadyStarted,

    #[error("Follower not running")]
    NotRunning,

    #[error("Core error: {0}")]
    Core(#[from] lane_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(ExecutorError::AlreadyStarted.to_string(), "Follower already started");
    }
}
