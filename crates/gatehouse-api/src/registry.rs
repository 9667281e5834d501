//! Gateway registry — resolves a gateway id to its connection config.
//!
//! The dashboard's own store is external to this service; it is reached
//! through [`GatewayRegistry`]. [`StaticGatewayRegistry`] serves the gateways
//! listed in the config file.

use async_trait::async_trait;
use gatehouse_types::{GatehouseResult, GatewayConfig, GatewayEntry};
use std::collections::HashMap;
use std::sync::RwLock;

/// Lookup of gateway configs by id.
#[async_trait]
pub trait GatewayRegistry: Send + Sync {
    /// `Ok(None)` when no gateway has this id.
    async fn resolve(&self, gateway_id: &str) -> GatehouseResult<Option<GatewayConfig>>;
}

/// In-memory registry.
#[derive(Default)]
pub struct StaticGatewayRegistry {
    gateways: RwLock<HashMap<String, GatewayConfig>>,
}

impl StaticGatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config entries; later duplicates win.
    pub fn from_entries(entries: &[GatewayEntry]) -> Self {
        let registry = Self::new();
        for entry in entries {
            registry.insert(&entry.id, entry.config.clone());
        }
        registry
    }

    /// Register or replace a gateway.
    pub fn insert(&self, gateway_id: &str, config: GatewayConfig) {
        self.gateways
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(gateway_id.to_string(), config);
    }

    pub fn remove(&self, gateway_id: &str) -> Option<GatewayConfig> {
        self.gateways
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(gateway_id)
    }

    pub fn len(&self) -> usize {
        self.gateways.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl GatewayRegistry for StaticGatewayRegistry {
    async fn resolve(&self, gateway_id: &str) -> GatehouseResult<Option<GatewayConfig>> {
        Ok(self
            .gateways
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(gateway_id)
            .cloned())
    }
}
