//! Gateway RPC envelope types.
//!
//! Every request is a JSON text frame `{"id", "method", "params"}`. The gateway
//! answers with `{"id", "result"}` or `{"id", "error": {"message"}}`. Frames
//! without an `id` are server-pushed events and carry no correlation.

use crate::error::WireError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method name of the authentication handshake.
pub const CONNECT_METHOD: &str = "connect";

/// An outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id, unique per in-flight call on one connection.
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Error object of a failed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,
}

/// An inbound frame: a response when `id` is set, an event otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    /// A successful response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            result: Some(result),
            error: None,
        }
    }

    /// A failed response.
    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            result: None,
            error: Some(RpcErrorBody {
                message: message.into(),
                code: None,
            }),
        }
    }

    /// Settle the response into the caller's result. An `error` wins over a
    /// `result`; a response with neither resolves to `null`.
    pub fn into_outcome(self) -> Result<Value, WireError> {
        match self.error {
            Some(err) => Err(WireError::Remote(err.message)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Encode a request as a text frame.
pub fn encode_request(request: &RpcRequest) -> Result<String, WireError> {
    Ok(serde_json::to_string(request)?)
}

/// Parse an inbound text frame.
pub fn decode_frame(text: &str) -> Result<RpcResponse, WireError> {
    Ok(serde_json::from_str(text)?)
}
