//! Runtime client errors

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a container engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Engine could not be reached or failed transiently
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// Call did not finish within its deadline
    #[error("runtime call {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Engine refused the request; retrying will not help
    #[error("runtime rejected request: {0}")]
    Rejected(String),

    /// No such container
    #[error("container not found: {0}")]
    NotFound(String),
}

impl RuntimeError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RuntimeError::Unavailable(_) | RuntimeError::Timeout { .. }
        )
    }
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
