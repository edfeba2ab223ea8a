//! Proxy synchronization errors

use thiserror::Error;

/// Errors pushing configuration to the proxy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// Proxy refused the route document
    #[error("proxy rejected configuration: {0}")]
    Rejected(String),

    /// Proxy could not be reached or failed transiently
    #[error("proxy unavailable: {0}")]
    Unavailable(String),
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
