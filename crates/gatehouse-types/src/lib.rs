//! Core types for the Gatehouse gateway client.
//!
//! This crate defines the data shared between the wire layer, the pool and the
//! HTTP facade: gateway connection settings, the provisioning request model,
//! gateway RPC result shapes and the error taxonomy. It contains no I/O.

pub mod config;
pub mod error;
pub mod provision;
pub mod session;

pub use config::{GatewayConfig, GatewayEntry, PoolConfig, RpcConfig, ServiceConfig};
pub use error::{GatehouseError, GatehouseResult};
pub use provision::{AgentSpec, ProvisionRequest, SessionKey, WorkspaceSpec};
pub use session::{
    ChatHistory, HistoryEntry, SendMessageBody, SendReceipt, SessionList, SessionSummary,
};
