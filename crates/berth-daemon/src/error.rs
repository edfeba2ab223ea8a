//! Error types for berthd

use berth_proxy::ProxyError;
use berth_reconciler::{ReconcileError, StoreError};
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Spec store error: {0}")]
    Store(#[from] StoreError),

    #[error("Proxy control error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Reconciler error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<config::ConfigError> for DaemonError {
    fn from(e: config::ConfigError) -> Self {
        DaemonError::Config(e.to_string())
    }
}

pub type DaemonResult<T> = Result<T, DaemonError>;
