//! Error handling for inferlane
//!
//! A unified error type shared across all inferlane components, with helper
//! constructors and a category accessor for logs and counters.

use crate::messages::CtrlStatus;

/// Result type alias for inferlane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for inferlane
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed message or string key
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// A frontend registered with an id already in use
    #[error("Frontend id conflict: {0}")]
    FrontendIdConflict(String),

    /// A backend registered with an id already in use
    #[error("Backend id conflict: {0}")]
    BackendIdConflict(String),

    /// No route exists for the requested model session
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The route is empty or its chosen backend disappeared
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The node never registered or was already removed
    #[error("Node not registered: {0}")]
    NotRegistered(String),

    /// No profile recorded for a model on a specific GPU
    #[error("Profile missing: {0}")]
    ProfileMissing(String),

    /// A batch plan's deadline passed before execution
    #[error("Deadline missed: {0}")]
    DeadlineMissed(String),

    /// An outbound send wrote fewer bytes than the message
    #[error("Short send: {0}")]
    ShortSend(String),

    /// A delegate's outbound channel is closed or full
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// CPU affinity could not be applied. Fatal at startup.
    #[error("Affinity error: {0}")]
    Affinity(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn model_not_found(msg: impl Into<String>) -> Self {
        Self::ModelNotFound(msg.into())
    }

    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn not_registered(msg: impl Into<String>) -> Self {
        Self::NotRegistered(msg.into())
    }

    pub fn profile_missing(msg: impl Into<String>) -> Self {
        Self::ProfileMissing(msg.into())
    }

    pub fn deadline_missed(msg: impl Into<String>) -> Self {
        Self::DeadlineMissed(msg.into())
    }

    pub fn short_send(msg: impl Into<String>) -> Self {
        Self::ShortSend(msg.into())
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }

    pub fn affinity(msg: impl Into<String>) -> Self {
        Self::Affinity(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The error category for logs and counters
    pub fn category(&self) -> &'static str {
        match self {
            Error::Parse(_) => "parse",
            Error::InvalidConfiguration(_) => "configuration",
            Error::FrontendIdConflict(_) => "frontend_id_conflict",
            Error::BackendIdConflict(_) => "backend_id_conflict",
            Error::ModelNotFound(_) => "model_not_found",
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::NotRegistered(_) => "not_registered",
            Error::ProfileMissing(_) => "profile_missing",
            Error::DeadlineMissed(_) => "deadline_missed",
            Error::ShortSend(_) => "short_send",
            Error::ChannelClosed(_) => "channel_closed",
            Error::Affinity(_) => "affinity",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Yaml(_) => "yaml",
            Error::Other(_) => "other",
        }
    }

    /// Whether this error aborts the process instead of being observed and
    /// skipped. Only startup-time invariant violations qualify.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Affinity(_))
    }

    /// Map onto the control status returned to remote callers, where a
    /// mapping exists
    pub fn ctrl_status(&self) -> Option<CtrlStatus> {
        match self {
            Error::FrontendIdConflict(_) => Some(CtrlStatus::FrontendIdConflict),
            Error::BackendIdConflict(_) => Some(CtrlStatus::BackendIdConflict),
            Error::ModelNotFound(_) => Some(CtrlStatus::ModelNotFound),
            Error::BackendUnavailable(_) => Some(CtrlStatus::BackendUnavailable),
            Error::NotRegistered(_) => Some(CtrlStatus::NotRegistered),
            Error::ProfileMissing(_) => Some(CtrlStatus::InvalidLoadModelRequest),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::model_not_found("tensorflow:resnet50:1:50000");
        assert!(matches!(err, Error::ModelNotFound(_)));
        assert_eq!(err.to_string(), "Model not found: tensorflow:resnet50:1:50000");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::parse("bad").category(), "parse");
        assert_eq!(Error::backend_unavailable("b1").category(), "backend_unavailable");
        assert_eq!(Error::deadline_missed("plan 3").category(), "deadline_missed");
    }

    #[test]
    fn test_only_affinity_is_fatal() {
        assert!(Error::affinity("cpu 7").is_fatal());
        assert!(!Error::short_send("reply").is_fatal());
        assert!(!Error::internal("drr").is_fatal());
    }

    #[test]
    fn test_ctrl_status_mapping() {
        assert_eq!(
            Error::model_not_found("m").ctrl_status(),
            Some(CtrlStatus::ModelNotFound)
        );
        assert_eq!(
            Error::profile_missing("p").ctrl_status(),
            Some(CtrlStatus::InvalidLoadModelRequest)
        );
        assert_eq!(Error::parse("x").ctrl_status(), None);
    }
}
