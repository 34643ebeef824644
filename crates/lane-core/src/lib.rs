//! # lane-core
//!
//! Core types and utilities for inferlane, a latency-SLA-aware dispatcher
//! and scheduler for multi-tenant GPU inference clusters.
//!
//! This crate provides the foundational pieces shared across all other
//! inferlane components:
//!
//! - Node and plan identifiers, backend descriptions
//! - Model sessions and their canonical string keys
//! - Calibrated model profiles and the read-only profile registry
//! - The monotonic clock and per-query punch-clock tags
//! - Control-plane message types consumed by the transports
//! - Configuration schema and parsing utilities
//! - The unified error type

pub mod clock;
pub mod config;
pub mod error;
pub mod messages;
pub mod profile;
pub mod session;
pub mod types;

// Re-export commonly used types at the crate root
pub use clock::{now_ns, PunchClock};
pub use config::{DispatcherConfig, StaticWorkloadEntry};
pub use error::{Error, Result};
pub use messages::{
    BackendCommand, BackendRate, BatchPlan, CtrlReply, CtrlStatus, DispatchReply,
    DispatchRequest, FrontendNotice, KeepAliveRequest, LoadModelReply, LoadModelRequest,
    ModelRouteUpdate, PayloadDescriptor, Query, RegisterReply, RegisterRequest,
    UnregisterRequest,
};
pub use profile::{ModelProfile, ProfileRegistry};
pub use session::ModelSession;
pub use types::{BackendInfo, GlobalId, NodeId, NodeKind, PlanId};
