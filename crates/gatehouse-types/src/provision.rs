//! Agent provisioning request model.
//!
//! A provisioning body arrives as loosely-typed JSON from the dashboard. It is
//! validated here, purely locally, into a [`ProvisionRequest`] whose required
//! fields are guaranteed present. Nothing downstream needs to re-check them.

use crate::error::{GatehouseError, GatehouseResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Prefix shared by every agent session key.
pub const SESSION_KEY_PREFIX: &str = "agent:";

/// Suffix naming the agent's primary session.
const MAIN_SESSION: &str = "main";

/// Opaque key of an agent's gateway session.
///
/// Derived only from the agent id, so repeated provisioning of the same agent
/// always lands on the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Session key for the agent with the given id.
    pub fn for_agent(agent_id: &str) -> Self {
        Self(format!("{SESSION_KEY_PREFIX}{agent_id}:{MAIN_SESSION}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated agent identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSpec {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub role: String,
    /// Any additional fields the dashboard sent along.
    #[serde(flatten)]
    pub profile: Map<String, Value>,
}

/// Validated workspace identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceSpec {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub slug: String,
}

/// A fully validated provisioning request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub gateway_id: String,
    pub agent: AgentSpec,
    pub workspace: WorkspaceSpec,
    /// Teammates in the same workspace, passed through as sent.
    pub other_agents: Vec<Value>,
    /// Dashboard URL the agent calls back into.
    pub base_url: String,
    /// Bearer token for dashboard callbacks; empty when not provided.
    pub auth_token: String,
}

impl ProvisionRequest {
    /// Validate a raw request body.
    ///
    /// Required: `agent{_id,name,role}`, `workspace{_id,name,slug}`, `baseUrl`.
    /// Empty strings count as missing. `otherAgents` defaults to `[]` and
    /// `authToken` to `""`.
    pub fn from_body(gateway_id: &str, body: &Value) -> GatehouseResult<Self> {
        let body = body.as_object().ok_or_else(|| {
            GatehouseError::Validation("Request body must be a JSON object".to_string())
        })?;

        let agent = required_object(body, "agent")?;
        let agent_id = required_str(agent, "agent", "_id")?;
        let agent_name = required_str(agent, "agent", "name")?;
        let agent_role = required_str(agent, "agent", "role")?;

        let workspace = required_object(body, "workspace")?;
        let workspace_id = required_str(workspace, "workspace", "_id")?;
        let workspace_name = required_str(workspace, "workspace", "name")?;
        let workspace_slug = required_str(workspace, "workspace", "slug")?;

        let base_url = match body.get("baseUrl").and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => s.to_string(),
            _ => return Err(GatehouseError::missing("baseUrl")),
        };

        let other_agents = match body.get("otherAgents") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(GatehouseError::Validation(
                    "otherAgents must be an array".to_string(),
                ))
            }
        };

        let auth_token = body
            .get("authToken")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let profile = agent
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "_id" | "name" | "role"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            gateway_id: gateway_id.to_string(),
            agent: AgentSpec {
                id: agent_id,
                name: agent_name,
                role: agent_role,
                profile,
            },
            workspace: WorkspaceSpec {
                id: workspace_id,
                name: workspace_name,
                slug: workspace_slug,
            },
            other_agents,
            base_url,
            auth_token,
        })
    }

    /// Session key the provisioned agent will use.
    pub fn session_key(&self) -> SessionKey {
        SessionKey::for_agent(&self.agent.id)
    }
}

fn required_object<'a>(
    body: &'a Map<String, Value>,
    field: &str,
) -> GatehouseResult<&'a Map<String, Value>> {
    body.get(field)
        .and_then(Value::as_object)
        .ok_or_else(|| GatehouseError::missing(field))
}

fn required_str(obj: &Map<String, Value>, parent: &str, field: &str) -> GatehouseResult<String> {
    match obj.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
        _ => Err(GatehouseError::missing(&format!("{parent}.{field}"))),
    }
}
