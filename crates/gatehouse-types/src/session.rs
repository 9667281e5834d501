//! Result shapes of the gateway's session and chat methods.
//!
//! Decoding is lenient: unknown fields are kept in `extra` so the dashboard
//! sees everything the gateway returned, and a missing or `null` list is
//! an empty one.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// One session as reported by `sessions.list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of `sessions.list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub sessions: Vec<SessionSummary>,
}

/// One transcript entry from `chat.history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Some gateways send `role` instead; that stays in `extra`.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub timestamp: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of `chat.history`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatHistory {
    #[serde(default, deserialize_with = "null_as_default")]
    pub history: Vec<HistoryEntry>,
}

/// Body of a send-message request from the dashboard.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub session_key: Option<String>,
    pub content: Option<String>,
}

/// Acknowledgement returned by `chat.send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    #[serde(default = "default_ok")]
    pub ok: bool,
}

impl Default for SendReceipt {
    fn default() -> Self {
        Self { ok: true }
    }
}

fn default_ok() -> bool {
    true
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
