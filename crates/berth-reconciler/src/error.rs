//! Reconciler errors

use berth_runtime::RuntimeError;
use berth_types::{SpecValidationError, TransitionError};
use thiserror::Error;

/// Spec store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for spec store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the reconciler
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Spec failed validation; the caller must fix it
    #[error("invalid spec: {0}")]
    InvalidSpec(#[from] SpecValidationError),

    #[error("service not found: {0}")]
    NotFound(String),

    /// Another apply for the same name is in flight
    #[error("conflicting apply in flight for service {0}")]
    ConflictingName(String),

    /// Transient runtime failure, retried by the control loop
    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Deterministic runtime failure
    #[error("runtime rejected: {0}")]
    RuntimeRejected(String),

    #[error("spec store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl ReconcileError {
    pub fn from_runtime(operation: &str, error: &RuntimeError) -> Self {
        let message = format!("{} failed: {}", operation, error);
        if error.is_transient() {
            ReconcileError::RuntimeUnavailable(message)
        } else {
            ReconcileError::RuntimeRejected(message)
        }
    }
}

/// Result type for reconciler operations
pub type ReconcileResult<T> = Result<T, ReconcileError>;
