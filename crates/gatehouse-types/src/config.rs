//! Configuration types for the Gatehouse service.
//!
//! The service config is read from `~/.gatehouse/config.toml`; see the loader
//! in `gatehouse-api`. Every section has defaults so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Placeholder shown instead of a real token.
pub const REDACTED: &str = "***";

/// Connection settings for one remote gateway.
///
/// Immutable once handed to the pool: two configs that differ in any
/// connection field are different pool identities.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// WebSocket endpoint (`ws://`, `wss://`, or their `http(s)://` spellings).
    pub url: String,
    /// Bearer token presented during the handshake.
    #[serde(default)]
    pub token: String,
    /// Skip device identity during the handshake.
    #[serde(default)]
    pub disable_device_pairing: bool,
    /// Accept any TLS certificate from the gateway.
    #[serde(default)]
    pub allow_insecure_tls: bool,
    /// Opaque to this service; passed through to callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
}

impl GatewayConfig {
    /// Config for `url` authenticated with `token`, all flags off.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            ..Default::default()
        }
    }

    /// Copy of this config with the token replaced by a placeholder.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.token.is_empty() {
            copy.token = REDACTED.to_string();
        }
        copy
    }
}

// Tokens must never reach the logs.
impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("url", &self.url)
            .field(
                "token",
                &if self.token.is_empty() { "" } else { REDACTED },
            )
            .field("disable_device_pairing", &self.disable_device_pairing)
            .field("allow_insecure_tls", &self.allow_insecure_tls)
            .field("workspace_root", &self.workspace_root)
            .finish()
    }
}

/// A gateway as declared in the `[[gateways]]` config list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEntry {
    /// Identifier used in routes (`/api/gateways/{id}/...`).
    pub id: String,
    #[serde(flatten)]
    pub config: GatewayConfig,
}

/// RPC timing knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Default per-call timeout.
    pub call_timeout_ms: u64,
    /// Budget for TCP + TLS + upgrade + authentication.
    pub handshake_timeout_ms: u64,
    /// Budget for a liveness probe.
    pub ping_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            handshake_timeout_ms: 10_000,
            ping_timeout_ms: 5_000,
        }
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Connection pool tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Unreferenced entries idle longer than this are evicted.
    pub idle_ttl_secs: u64,
    /// Unreferenced entries idle longer than this are pinged before reuse.
    pub probe_idle_after_secs: u64,
    /// How often the eviction sweeper runs.
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 300,
            probe_idle_after_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

impl PoolConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn probe_idle_after(&self) -> Duration {
        Duration::from_secs(self.probe_idle_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Root service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Address the HTTP API binds to.
    pub listen_addr: String,
    pub rpc: RpcConfig,
    pub pool: PoolConfig,
    /// Gateways known at startup.
    pub gateways: Vec<GatewayEntry>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4300".to_string(),
            rpc: RpcConfig::default(),
            pool: PoolConfig::default(),
            gateways: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Copy of this config safe to print.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for entry in &mut copy.gateways {
            entry.config = entry.config.redacted();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_token() {
        let config = GatewayConfig::new("wss://gw.example.com", "super-secret");
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("***"));
        assert!(debug.contains("wss://gw.example.com"));
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: ServiceConfig = toml::from_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.rpc.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.pool.idle_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_gateway_list_parses() {
        let raw = r#"
            listen_addr = "0.0.0.0:8080"

            [rpc]
            call_timeout_ms = 1500

            [[gateways]]
            id = "gw-main"
            url = "wss://gw.example.com/ws"
            token = "tok"
            allow_insecure_tls = true
            workspace_root = "/srv/agents"
        "#;
        let config: ServiceConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.rpc.call_timeout_ms, 1500);
        assert_eq!(config.rpc.handshake_timeout_ms, 10_000);
        assert_eq!(config.gateways.len(), 1);
        let gw = &config.gateways[0];
        assert_eq!(gw.id, "gw-main");
        assert_eq!(gw.config.token, "tok");
        assert!(gw.config.allow_insecure_tls);
        assert!(!gw.config.disable_device_pairing);
        assert_eq!(gw.config.workspace_root.as_deref(), Some("/srv/agents"));
    }

    #[test]
    fn test_service_config_redacted() {
        let mut config = ServiceConfig::default();
        config.gateways.push(GatewayEntry {
            id: "a".into(),
            config: GatewayConfig::new("ws://a", "secret"),
        });
        config.gateways.push(GatewayEntry {
            id: "b".into(),
            config: GatewayConfig::new("ws://b", ""),
        });
        let redacted = config.redacted();
        assert_eq!(redacted.gateways[0].config.token, REDACTED);
        assert_eq!(redacted.gateways[1].config.token, "");
        assert_eq!(config.gateways[0].config.token, "secret");
    }

    #[test]
    fn test_sweep_interval_never_zero() {
        let pool = PoolConfig {
            sweep_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(pool.sweep_interval(), Duration::from_secs(1));
    }
}
