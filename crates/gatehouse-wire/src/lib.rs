//! Gatehouse wire layer — talking to remote agent gateways.
//!
//! Provides the client side of the gateway RPC protocol: an authenticated
//! WebSocket transport, request/response correlation over one connection, and
//! a process-wide pool that shares connections across requests.
//!
//! ## Architecture
//!
//! - **GatewayConnector**: Opens one authenticated connection to a gateway
//! - **RpcChannel**: Multiplexes id-correlated calls over that connection
//! - **ConnectionPool**: Keyed, reference-counted, single-flight connection cache
//! - **PoolHandle**: Trait the facade acquires/releases pooled connections through

pub mod channel;
pub mod error;
pub mod message;
pub mod pool;
pub mod transport;

pub use channel::RpcChannel;
pub use error::WireError;
pub use message::{RpcErrorBody, RpcRequest, RpcResponse};
pub use pool::{build_cache_key, ConnectionPool, ConnectionState, PoolHandle, PoolLease, PoolStats};
pub use transport::{ConnectionHandle, GatewayConnection, GatewayConnector, WsConnector};
