//! Common error types for Concord components.

use thiserror::Error;

/// Errors surfaced by the coordination layer
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable store unavailable or failed mid-operation; retry next tick
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Optimistic update lost the race against a concurrent writer
    #[error("Stale update conflict: {0}")]
    StaleConflict(String),

    /// Replay backend did not answer in time
    #[error("Backend operation timed out: {0}")]
    BackendTimeout(String),

    /// Replay backend failed for a reason other than a timeout
    #[error("Backend error: {0}")]
    Backend(String),

    /// Replay uniqueness check could not be performed
    #[error("Replay check failed: {0}")]
    CheckFailed(String),

    /// Node removal refused because the node still reports in
    #[error("Node {node_id} is not stale (last update {idle_ms}ms ago)")]
    NotStale { node_id: String, idle_ms: i64 },

    /// Message id was already seen and has not expired
    #[error("Duplicate message id: {0}")]
    Duplicate(String),

    /// Multicast group address could not be computed
    #[error("Multicast address derivation failed: {0}")]
    Derivation(String),

    /// Blocking lock variants are not provided
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ClusterError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config(_) => 500,
            Self::TransientStore(_) => 503,
            Self::StaleConflict(_) => 409,
            Self::BackendTimeout(_) => 504,
            Self::Backend(_) => 503,
            Self::CheckFailed(_) => 500,
            Self::NotStale { .. } => 409,
            Self::Duplicate(_) => 409,
            Self::Derivation(_) => 500,
            Self::Unsupported(_) => 501,
            Self::NotFound(_) => 404,
            Self::InvalidInput(_) => 400,
        }
    }

    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientStore(_) | Self::BackendTimeout(_) | Self::StaleConflict(_)
        )
    }
}

/// Result alias for coordination-layer operations
pub type Result<T> = std::result::Result<T, ClusterError>;
