//! Service assembly and the HTTP server lifecycle.
//!
//! Builds the registry, connector, pool and facade from a [`ServiceConfig`],
//! runs the pool sweeper alongside the HTTP server, and closes every pooled
//! connection once the server has drained.

use crate::facade::GatewayFacade;
use crate::registry::StaticGatewayRegistry;
use crate::routes::{build_router, AppState};
use axum::Router;
use gatehouse_types::ServiceConfig;
use gatehouse_wire::{ConnectionPool, GatewayConnector, PoolHandle, WsConnector};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// The assembled service.
pub struct Gatehouse {
    pub registry: Arc<StaticGatewayRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub state: Arc<AppState>,
}

impl Gatehouse {
    /// Wire up production components for `config`.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let connector: Arc<dyn GatewayConnector> = Arc::new(WsConnector::new(config.rpc.clone()));
        Self::with_connector(config, connector)
    }

    /// Wire up the service around a specific connector.
    pub fn with_connector(config: &ServiceConfig, connector: Arc<dyn GatewayConnector>) -> Self {
        let registry = Arc::new(StaticGatewayRegistry::from_entries(&config.gateways));
        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&connector),
            config.pool.clone(),
        ));
        let facade = GatewayFacade::new(
            registry.clone(),
            connector,
            pool.clone() as Arc<dyn PoolHandle>,
            &config.rpc,
        );
        Self {
            registry,
            pool,
            state: Arc::new(AppState { facade }),
        }
    }

    pub fn router(&self) -> Router {
        build_router(Arc::clone(&self.state))
    }
}

/// Bind `config.listen_addr` and serve until `shutdown` resolves.
pub async fn run_server(
    config: ServiceConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&config.listen_addr).await?;
    serve(listener, Gatehouse::from_config(&config), shutdown).await
}

/// Serve on an already-bound listener until `shutdown` resolves, then shut
/// the pool down.
pub async fn serve(
    listener: TcpListener,
    service: Gatehouse,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    let sweeper = service.pool.spawn_sweeper();
    info!(
        %addr,
        gateways = service.registry.len(),
        "Gatehouse API listening"
    );

    let result = axum::serve(listener, service.router())
        .with_graceful_shutdown(shutdown)
        .await;

    service.pool.shutdown().await;
    sweeper.abort();
    info!("Gatehouse API stopped");
    result
}
