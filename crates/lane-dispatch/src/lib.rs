//! # lane-dispatch
//!
//! The inferlane dispatcher: the control-plane process of a multi-tenant
//! GPU inference cluster.
//!
//! This crate provides:
//! - Registration and liveness tracking for frontend and backend nodes
//! - Deficit-round-robin routing of queries to backends
//! - Single-query batch-plan construction with execution times and deadlines
//! - Datagram RPC ingress with a bounded worker pool
//! - The periodic epoch scheduler that reshapes per-model backend rates
//!   from measured request rate
//! - Best-fit and bin-packing allocation of unassigned workloads

use thiserror::Error;

pub mod affinity;
pub mod delegate;
pub mod dispatcher;
pub mod ingress;
pub mod route;
pub mod scheduler;
pub mod service;

mod allocator;
mod state;

// Re-export main types
pub use delegate::{BackendDelegate, FrontendDelegate};
pub use dispatcher::{Dispatcher, DispatcherStats, NodeChannel};
pub use ingress::UdpRpcServer;
pub use route::ModelRoute;
pub use scheduler::SchedulerHandle;
pub use service::{ControlRequest, ControlResponse, ControlService};

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that can occur in the dispatcher
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Ingress error: {0}")]
    Ingress(String),

    #[error("Core error: {0}")]
    Core(#[from] lane_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_wraps_core() {
        let err: DispatchError = lane_core::Error::model_not_found("m").into();
        assert!(err.to_string().contains("Model not found"));
    }
}
