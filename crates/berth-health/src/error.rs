//! Error types for health monitoring

use berth_types::InstanceId;
use thiserror::Error;

/// Health monitoring errors
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("instance {0} is not registered")]
    NotRegistered(InstanceId),

    #[error("instance {0} is already registered")]
    AlreadyRegistered(InstanceId),

    #[error("instance {0} has no network address")]
    NoAddress(InstanceId),

    #[error("instance {0} has no container")]
    NoContainer(InstanceId),

    #[error("exec probes need a runtime client")]
    NoRuntime,

    #[error("probe failed: {0}")]
    ProbeFailed(String),
}

/// Result type for health operations
pub type HealthResult<T> = Result<T, HealthError>;
