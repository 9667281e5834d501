//! Agent provisioning over a leased gateway connection.
//!
//! Provisioning registers the agent, writes its workspace briefing and labels
//! its main session, in that order. Any failed call aborts the sequence; the
//! caller is responsible for releasing the connection either way.

use async_trait::async_trait;
use gatehouse_types::{ProvisionRequest, SessionKey};
use gatehouse_wire::{GatewayConnection, WireError};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Registers or updates an agent record.
pub const UPSERT_METHOD: &str = "agents.upsert";
/// Writes a file into the agent's workspace.
pub const SET_FILE_METHOD: &str = "agents.files.set";
/// Updates session metadata.
pub const PATCH_SESSION_METHOD: &str = "sessions.patch";

/// Name of the briefing file written for each agent.
pub const BRIEFING_FILE: &str = "AGENTS.md";

/// Provisions agents on a gateway.
#[async_trait]
pub trait AgentProvisioner: Send + Sync {
    /// Provision `request.agent` using `connection`, returning its session key.
    async fn provision(
        &self,
        connection: &dyn GatewayConnection,
        request: &ProvisionRequest,
    ) -> Result<SessionKey, WireError>;
}

/// The standard three-call provisioning sequence.
pub struct GatewayProvisioner {
    call_timeout: Duration,
}

impl GatewayProvisioner {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }
}

#[async_trait]
impl AgentProvisioner for GatewayProvisioner {
    async fn provision(
        &self,
        connection: &dyn GatewayConnection,
        request: &ProvisionRequest,
    ) -> Result<SessionKey, WireError> {
        let session_key = request.session_key();
        let agent = &request.agent;

        connection
            .call(
                UPSERT_METHOD,
                json!({
                    "agentId": agent.id,
                    "name": agent.name,
                    "role": agent.role,
                    "sessionKey": session_key,
                    "workspace": {
                        "id": request.workspace.id,
                        "name": request.workspace.name,
                        "slug": request.workspace.slug,
                    },
                    "profile": agent.profile,
                }),
                self.call_timeout,
            )
            .await?;
        debug!(agent_id = %agent.id, "Agent record upserted");

        connection
            .call(
                SET_FILE_METHOD,
                json!({
                    "agentId": agent.id,
                    "name": BRIEFING_FILE,
                    "content": render_briefing(request),
                }),
                self.call_timeout,
            )
            .await?;
        debug!(agent_id = %agent.id, "Agent briefing written");

        connection
            .call(
                PATCH_SESSION_METHOD,
                json!({ "key": session_key, "label": agent.name }),
                self.call_timeout,
            )
            .await?;

        info!(
            gateway_id = %request.gateway_id,
            agent_id = %agent.id,
            session_key = %session_key,
            "Agent provisioned"
        );
        Ok(session_key)
    }
}

/// Markdown briefing telling the agent who it is and how to reach the dashboard.
pub fn render_briefing(request: &ProvisionRequest) -> String {
    let agent = &request.agent;
    let workspace = &request.workspace;
    let mut lines = vec![
        format!("# {}", agent.name),
        String::new(),
        format!(
            "You are **{}**, working as **{}** in the workspace **{}** (`{}`).",
            agent.name, agent.role, workspace.name, workspace.slug
        ),
        String::new(),
        "## Teammates".to_string(),
        String::new(),
    ];

    let teammates: Vec<String> = request
        .other_agents
        .iter()
        .filter_map(teammate_line)
        .map(|line| format!("- {line}"))
        .collect();
    if teammates.is_empty() {
        lines.push("You are the only agent in this workspace.".to_string());
    } else {
        lines.extend(teammates);
    }

    lines.extend([
        String::new(),
        "## Dashboard".to_string(),
        String::new(),
        format!("- Base URL: {}", request.base_url),
        format!("- Workspace ID: {}", workspace.id),
        format!("- Agent ID: {}", agent.id),
    ]);
    if !request.auth_token.is_empty() {
        lines.push(format!("- Authorization: Bearer {}", request.auth_token));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// `Name (role)` for a teammate entry; entries without a name are skipped.
fn teammate_line(entry: &Value) -> Option<String> {
    let name = entry.get("name").and_then(Value::as_str)?.trim();
    if name.is_empty() {
        return None;
    }
    Some(match entry.get("role").and_then(Value::as_str) {
        Some(role) if !role.trim().is_empty() => format!("{name} ({role})"),
        _ => name.to_string(),
    })
}
