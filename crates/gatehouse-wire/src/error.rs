//! Errors from the gateway wire layer.

use gatehouse_types::GatehouseError;
use thiserror::Error;

/// Errors from connecting to or calling a gateway.
///
/// `Clone` so that every caller sharing one in-flight connect attempt can
/// receive the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The transport or authentication handshake did not complete.
    #[error("{0}")]
    ConnectFailed(String),
    /// No response arrived for the call in time.
    #[error("RPC call timeout: {method}")]
    Timeout { method: String },
    /// The gateway answered with an error; its message verbatim.
    #[error("{0}")]
    Remote(String),
    /// The connection is gone.
    #[error("Gateway connection closed")]
    ConnectionClosed,
    /// A frame could not be encoded or a result had an unexpected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<WireError> for GatehouseError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::ConnectFailed(msg) => GatehouseError::Connect(msg),
            WireError::Timeout { .. } => GatehouseError::RpcTimeout(e.to_string()),
            WireError::Remote(msg) => GatehouseError::RpcMethod(msg),
            WireError::ConnectionClosed | WireError::Protocol(_) => {
                GatehouseError::RpcMethod(e.to_string())
            }
        }
    }
}
