//! GatewayFacade — the entry point route handlers call into.
//!
//! Every operation runs in the same order: local validation, then registry
//! lookup, then network. A request that fails validation never resolves a
//! gateway, and an unknown gateway never reaches the connector or the pool.
//!
//! Read and send operations are one-shot: connect, call once, close. Agent
//! provisioning goes through the pool: acquire, provision, release. Cleanup
//! runs on every exit path, including when the caller's future is dropped.

use crate::provisioning::{AgentProvisioner, GatewayProvisioner};
use crate::registry::GatewayRegistry;
use gatehouse_types::{
    ChatHistory, GatehouseError, GatehouseResult, GatewayConfig, ProvisionRequest, RpcConfig,
    SendMessageBody, SendReceipt, SessionKey, SessionList,
};
use gatehouse_wire::{
    ConnectionHandle, GatewayConnection, GatewayConnector, PoolHandle, PoolLease, PoolStats,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const SESSIONS_LIST_METHOD: &str = "sessions.list";
pub const CHAT_HISTORY_METHOD: &str = "chat.history";
pub const CHAT_SEND_METHOD: &str = "chat.send";

/// Operations reachable through the gateway RPC route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayAction {
    Sessions,
    History,
    Send,
    Provision,
}

impl GatewayAction {
    /// Whether the action mutates gateway state (served over POST).
    pub fn is_write(self) -> bool {
        matches!(self, Self::Send | Self::Provision)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sessions => "sessions",
            Self::History => "history",
            Self::Send => "send",
            Self::Provision => "provision",
        }
    }
}

impl fmt::Display for GatewayAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayAction {
    type Err = GatehouseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sessions" => Ok(Self::Sessions),
            "history" => Ok(Self::History),
            "send" => Ok(Self::Send),
            "provision" => Ok(Self::Provision),
            other => Err(unsupported_action(other)),
        }
    }
}

/// Error for an action name that is unknown or not valid for the HTTP method.
pub fn unsupported_action(action: &str) -> GatehouseError {
    GatehouseError::Validation(format!("Unsupported action: {action}"))
}

/// Inputs an action may draw on.
#[derive(Debug, Clone, Default)]
pub struct ActionInput {
    /// `sessionKey` query parameter.
    pub session_key: Option<String>,
    /// Parsed request body; `Null` when none was sent.
    pub body: Value,
}

/// Response of a successful provisioning.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionOutcome {
    pub ok: bool,
    pub session_key: SessionKey,
}

pub struct GatewayFacade {
    registry: Arc<dyn GatewayRegistry>,
    connector: Arc<dyn GatewayConnector>,
    pool: Arc<dyn PoolHandle>,
    provisioner: Arc<dyn AgentProvisioner>,
    call_timeout: Duration,
}

impl GatewayFacade {
    pub fn new(
        registry: Arc<dyn GatewayRegistry>,
        connector: Arc<dyn GatewayConnector>,
        pool: Arc<dyn PoolHandle>,
        rpc: &RpcConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            pool,
            provisioner: Arc::new(GatewayProvisioner::new(rpc.call_timeout())),
            call_timeout: rpc.call_timeout(),
        }
    }

    /// Replace the provisioning protocol.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn AgentProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Run `action` against `gateway_id`.
    pub async fn dispatch(
        &self,
        action: GatewayAction,
        gateway_id: &str,
        input: ActionInput,
    ) -> GatehouseResult<Value> {
        debug!(gateway_id, %action, "Dispatching gateway action");
        match action {
            GatewayAction::Sessions => to_json(self.list_sessions(gateway_id).await?),
            GatewayAction::History => to_json(
                self.chat_history(gateway_id, input.session_key.as_deref())
                    .await?,
            ),
            GatewayAction::Send => {
                let body = if input.body.is_null() {
                    SendMessageBody::default()
                } else {
                    serde_json::from_value(input.body).map_err(|e| {
                        GatehouseError::Validation(format!("Invalid request body: {e}"))
                    })?
                };
                to_json(self.send_message(gateway_id, body).await?)
            }
            GatewayAction::Provision => {
                to_json(self.provision_agent(gateway_id, &input.body).await?)
            }
        }
    }

    /// `sessions.list` over a one-shot connection.
    pub async fn list_sessions(&self, gateway_id: &str) -> GatehouseResult<SessionList> {
        let config = self.resolve(gateway_id).await?;
        let result = self
            .one_shot(gateway_id, &config, SESSIONS_LIST_METHOD, json!({}))
            .await?;
        decode(SESSIONS_LIST_METHOD, result)
    }

    /// `chat.history` for one session over a one-shot connection.
    pub async fn chat_history(
        &self,
        gateway_id: &str,
        session_key: Option<&str>,
    ) -> GatehouseResult<ChatHistory> {
        let session_key = required(session_key, "sessionKey")?;
        let config = self.resolve(gateway_id).await?;
        let result = self
            .one_shot(
                gateway_id,
                &config,
                CHAT_HISTORY_METHOD,
                json!({ "sessionKey": session_key }),
            )
            .await?;
        decode(CHAT_HISTORY_METHOD, result)
    }

    /// `chat.send` over a one-shot connection.
    pub async fn send_message(
        &self,
        gateway_id: &str,
        body: SendMessageBody,
    ) -> GatehouseResult<SendReceipt> {
        let session_key = required(body.session_key.as_deref(), "sessionKey")?;
        let content = required(body.content.as_deref(), "content")?;
        let config = self.resolve(gateway_id).await?;
        let result = self
            .one_shot(
                gateway_id,
                &config,
                CHAT_SEND_METHOD,
                json!({ "sessionKey": session_key, "message": content }),
            )
            .await?;
        decode(CHAT_SEND_METHOD, result)
    }

    /// Validate `body`, then provision the agent over a pooled connection.
    pub async fn provision_agent(
        &self,
        gateway_id: &str,
        body: &Value,
    ) -> GatehouseResult<ProvisionOutcome> {
        let request = ProvisionRequest::from_body(gateway_id, body)?;
        let config = self.resolve(gateway_id).await?;

        let lease = self.pool.acquire(gateway_id, &config).await?;
        let lease = LeaseGuard::new(self.pool.as_ref(), lease);
        let session_key = self
            .provisioner
            .provision(lease.connection(), &request)
            .await?;
        drop(lease);

        Ok(ProvisionOutcome {
            ok: true,
            session_key,
        })
    }

    async fn resolve(&self, gateway_id: &str) -> GatehouseResult<GatewayConfig> {
        self.registry
            .resolve(gateway_id)
            .await?
            .ok_or_else(|| GatehouseError::NotFound(gateway_id.to_string()))
    }

    /// Connect, make one call, close. Close runs before the call's outcome
    /// is inspected.
    async fn one_shot(
        &self,
        gateway_id: &str,
        config: &GatewayConfig,
        method: &str,
        params: Value,
    ) -> GatehouseResult<Value> {
        let connection = self.connector.connect(config).await?;
        let outcome = connection.call(method, params, self.call_timeout).await;
        connection.close().await;
        match &outcome {
            Ok(_) => debug!(gateway_id, method, "Gateway call succeeded"),
            Err(e) => info!(gateway_id, method, error = %e, "Gateway call failed"),
        }
        Ok(outcome?)
    }
}

/// Releases a pooled lease when dropped.
struct LeaseGuard<'a> {
    pool: &'a dyn PoolHandle,
    connection: ConnectionHandle,
    lease: Option<PoolLease>,
}

impl<'a> LeaseGuard<'a> {
    fn new(pool: &'a dyn PoolHandle, lease: PoolLease) -> Self {
        Self {
            pool,
            connection: Arc::clone(lease.connection()),
            lease: Some(lease),
        }
    }

    fn connection(&self) -> &dyn GatewayConnection {
        self.connection.as_ref()
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.pool.release(lease);
        }
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> GatehouseResult<&'a str> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(GatehouseError::missing(field)),
    }
}

/// A `null` result means "nothing to report" and decodes to `T::default()`.
fn decode<T: DeserializeOwned + Default>(method: &str, result: Value) -> GatehouseResult<T> {
    if result.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(result).map_err(|e| {
        GatehouseError::RpcMethod(format!("Unexpected result from {method}: {e}"))
    })
}

fn to_json<T: Serialize>(value: T) -> GatehouseResult<Value> {
    serde_json::to_value(value).map_err(|e| GatehouseError::Internal(e.to_string()))
}
