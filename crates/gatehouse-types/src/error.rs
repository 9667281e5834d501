//! Shared error taxonomy for gateway operations.

use thiserror::Error;

/// Top-level error type surfaced by gateway operations.
///
/// Every variant except `NotFound` and `Internal` carries the underlying
/// message verbatim so operators can tell an offline gateway from a missing
/// method or a timeout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatehouseError {
    /// A required field is missing or malformed. Detected before any I/O.
    #[error("{0}")]
    Validation(String),

    /// The gateway identifier is not known to the registry.
    #[error("Gateway not found: {0}")]
    NotFound(String),

    /// The transport handshake failed or the gateway is unreachable.
    #[error("{0}")]
    Connect(String),

    /// A remote call did not answer in time.
    #[error("{0}")]
    RpcTimeout(String),

    /// A remote call answered with an error, or the connection dropped mid-call.
    #[error("{0}")]
    RpcMethod(String),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatehouseError {
    /// HTTP status code this error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Connect(_) | Self::RpcTimeout(_) | Self::RpcMethod(_) | Self::Internal(_) => 500,
        }
    }

    /// Shorthand for a missing required field.
    pub fn missing(field: &str) -> Self {
        Self::Validation(format!("{field} is required"))
    }
}

/// Alias for Result with GatehouseError.
pub type GatehouseResult<T> = Result<T, GatehouseError>;
