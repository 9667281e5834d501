//! Mock collaborators shared by the facade and route tests.
//!
//! Every mock counts how it was used so tests can assert the exact number of
//! connects, closes, acquires and releases an operation performed.

#![allow(dead_code)]

use async_trait::async_trait;
use gatehouse_api::{AgentProvisioner, GatewayFacade, GatewayRegistry};
use gatehouse_types::{
    GatehouseError, GatehouseResult, GatewayConfig, ProvisionRequest, RpcConfig, SessionKey,
};
use gatehouse_wire::{
    ConnectionHandle, GatewayConnection, GatewayConnector, PoolHandle, PoolLease, PoolStats,
    WireError,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GATEWAY_ID: &str = "gw-1";

pub fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        url: "wss://gw.example.com".to_string(),
        token: "gw-token".to_string(),
        disable_device_pairing: true,
        allow_insecure_tls: false,
        workspace_root: Some("/srv/agents".to_string()),
    }
}

pub fn provision_body() -> Value {
    json!({
        "agent": {"_id": "a1", "name": "Scout", "role": "researcher"},
        "workspace": {"_id": "w1", "name": "Lab", "slug": "lab"},
        "baseUrl": "https://dash.example.com"
    })
}

// ---------------------------------------------------------------------------
// Mock Registry
// ---------------------------------------------------------------------------

pub struct MockRegistry {
    gateways: HashMap<String, GatewayConfig>,
    pub lookups: AtomicUsize,
}

impl MockRegistry {
    pub fn with_gateway(id: &str, config: GatewayConfig) -> Arc<Self> {
        let mut gateways = HashMap::new();
        gateways.insert(id.to_string(), config);
        Arc::new(Self {
            gateways,
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayRegistry for MockRegistry {
    async fn resolve(&self, gateway_id: &str) -> GatehouseResult<Option<GatewayConfig>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.gateways.get(gateway_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Mock Connection — scripted replies, records calls and closes
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum Reply {
    Result(Value),
    Error(WireError),
    /// Never answers; the call fails once its timeout elapses.
    Silent,
}

pub struct MockConnection {
    reply: Mutex<Reply>,
    pub calls: Mutex<Vec<(String, Value)>>,
    pub closes: AtomicUsize,
}

impl MockConnection {
    pub fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply),
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GatewayConnection for MockConnection {
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, WireError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        let reply = self.reply.lock().unwrap().clone();
        match reply {
            Reply::Result(value) => Ok(value),
            Reply::Error(e) => Err(e),
            Reply::Silent => {
                tokio::time::sleep(timeout).await;
                Err(WireError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.closes() == 0
    }
}

// ---------------------------------------------------------------------------
// Mock Connector
// ---------------------------------------------------------------------------

pub struct MockConnector {
    connection: Arc<MockConnection>,
    fail_with: Option<WireError>,
    pub configs: Mutex<Vec<GatewayConfig>>,
}

impl MockConnector {
    pub fn new(connection: Arc<MockConnection>) -> Arc<Self> {
        Arc::new(Self {
            connection,
            fail_with: None,
            configs: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: WireError) -> Arc<Self> {
        Arc::new(Self {
            connection: MockConnection::new(Reply::Result(Value::Null)),
            fail_with: Some(error),
            configs: Mutex::new(Vec::new()),
        })
    }

    pub fn connects(&self) -> usize {
        self.configs.lock().unwrap().len()
    }
}

#[async_trait]
impl GatewayConnector for MockConnector {
    async fn connect(&self, config: &GatewayConfig) -> Result<ConnectionHandle, WireError> {
        self.configs.lock().unwrap().push(config.clone());
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(self.connection.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock Pool — records acquires, counts releases
// ---------------------------------------------------------------------------

pub struct MockPool {
    connection: Arc<MockConnection>,
    fail_with: Option<WireError>,
    pub acquires: Mutex<Vec<(String, GatewayConfig)>>,
    pub releases: AtomicUsize,
}

impl MockPool {
    pub fn new(connection: Arc<MockConnection>) -> Arc<Self> {
        Arc::new(Self {
            connection,
            fail_with: None,
            acquires: Mutex::new(Vec::new()),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn failing(error: WireError) -> Arc<Self> {
        Arc::new(Self {
            connection: MockConnection::new(Reply::Result(Value::Null)),
            fail_with: Some(error),
            acquires: Mutex::new(Vec::new()),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn acquires(&self) -> Vec<(String, GatewayConfig)> {
        self.acquires.lock().unwrap().clone()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PoolHandle for MockPool {
    async fn acquire(&self, gateway_id: &str, config: &GatewayConfig) -> Result<PoolLease, WireError> {
        self.acquires
            .lock()
            .unwrap()
            .push((gateway_id.to_string(), config.clone()));
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(PoolLease::detached(self.connection.clone(), gateway_id)),
        }
    }

    fn release(&self, _lease: PoolLease) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self) -> PoolStats {
        let acquired = self.acquires.lock().unwrap().len();
        PoolStats {
            entries: 1,
            busy: acquired.saturating_sub(self.releases()),
            references: acquired.saturating_sub(self.releases()),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Recording Provisioner
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingProvisioner {
    fail_with: Option<WireError>,
    pub requests: Mutex<Vec<ProvisionRequest>>,
}

impl RecordingProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(error: WireError) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(error),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ProvisionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentProvisioner for RecordingProvisioner {
    async fn provision(
        &self,
        _connection: &dyn GatewayConnection,
        request: &ProvisionRequest,
    ) -> Result<SessionKey, WireError> {
        self.requests.lock().unwrap().push(request.clone());
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(request.session_key()),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub registry: Arc<MockRegistry>,
    pub connection: Arc<MockConnection>,
    pub connector: Arc<MockConnector>,
    pub pool: Arc<MockPool>,
    pub provisioner: Arc<RecordingProvisioner>,
}

impl Harness {
    /// One registered gateway; every call answers `reply`.
    pub fn new(reply: Reply) -> Self {
        let connection = MockConnection::new(reply);
        Self {
            registry: MockRegistry::with_gateway(GATEWAY_ID, gateway_config()),
            connector: MockConnector::new(connection.clone()),
            pool: MockPool::new(connection.clone()),
            provisioner: RecordingProvisioner::new(),
            connection,
        }
    }

    pub fn facade(&self) -> GatewayFacade {
        let rpc = RpcConfig {
            call_timeout_ms: 50,
            ..Default::default()
        };
        GatewayFacade::new(
            self.registry.clone(),
            self.connector.clone(),
            self.pool.clone(),
            &rpc,
        )
        .with_provisioner(self.provisioner.clone())
    }
}

/// Unwrap the error of a facade result.
pub fn expect_err<T: std::fmt::Debug>(result: GatehouseResult<T>) -> GatehouseError {
    result.expect_err("operation should fail")
}
