//! HTTP API for the Gatehouse gateway client.
//!
//! Route handlers call into [`GatewayFacade`], which resolves gateways through
//! a [`GatewayRegistry`] and reaches them either one-shot through a connector
//! or through the shared connection pool.

pub mod config;
pub mod facade;
pub mod provisioning;
pub mod registry;
pub mod routes;
pub mod server;

pub use facade::{ActionInput, GatewayAction, GatewayFacade, ProvisionOutcome};
pub use provisioning::{AgentProvisioner, GatewayProvisioner};
pub use registry::{GatewayRegistry, StaticGatewayRegistry};
pub use routes::{build_router, AppState};
pub use server::{run_server, serve, Gatehouse};
