//! Gateway transport — opening authenticated connections.
//!
//! A [`GatewayConnector`] turns a [`GatewayConfig`] into a live
//! [`GatewayConnection`]. The production connector, [`WsConnector`], speaks
//! WebSocket: it upgrades (optionally over TLS), then authenticates with a
//! `connect` RPC as the first call on the new channel. The whole sequence is
//! bounded by the handshake timeout, and a failed attempt tears down whatever
//! it had opened before returning.

use crate::channel::RpcChannel;
use crate::error::WireError;
use crate::message::CONNECT_METHOD;
use async_trait::async_trait;
use gatehouse_types::{GatewayConfig, RpcConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::Connector;
use tracing::{debug, info, warn};
use url::Url;

/// Client name announced during the handshake.
const CLIENT_NAME: &str = "gatehouse";

/// One open connection to a gateway.
///
/// Implementations must make `close` idempotent and must keep serving
/// concurrent `call`s independently.
#[async_trait]
pub trait GatewayConnection: Send + Sync {
    /// Issue one correlated call and wait up to `timeout` for its response.
    async fn call(&self, method: &str, params: Value, timeout: Duration)
        -> Result<Value, WireError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> bool;

    /// Terminate the connection. Closing twice is a no-op.
    async fn close(&self);

    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;
}

/// Shared handle to an open connection.
pub type ConnectionHandle = Arc<dyn GatewayConnection>;

/// Opens connections to gateways.
#[async_trait]
pub trait GatewayConnector: Send + Sync + 'static {
    /// Connect and authenticate. Never returns a half-open handle.
    async fn connect(&self, config: &GatewayConfig) -> Result<ConnectionHandle, WireError>;
}

/// WebSocket connector for production gateways.
pub struct WsConnector {
    rpc: RpcConfig,
    /// Device identity presented when pairing is enabled.
    device_id: String,
}

impl WsConnector {
    /// Create a connector using the given timeouts.
    pub fn new(rpc: RpcConfig) -> Self {
        // Pin the process-wide TLS provider so default TLS setup never has to guess.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            rpc,
            device_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Use a fixed device identity instead of a per-process one.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Params of the `connect` handshake call.
    pub fn handshake_params(&self, config: &GatewayConfig) -> Value {
        let mut params = json!({
            "auth": { "token": config.token },
            "client": { "name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION") },
        });
        if !config.disable_device_pairing {
            params["device"] = json!({ "id": self.device_id });
        }
        params
    }

    async fn open(
        &self,
        url: &Url,
        config: &GatewayConfig,
        budget: Duration,
    ) -> Result<RpcChannel, WireError> {
        let mut request = url.as_str().into_client_request().map_err(|e| {
            WireError::ConnectFailed(format!("Invalid gateway URL '{url}': {e}"))
        })?;
        if !config.token.is_empty() {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", config.token)).map_err(|_| {
                WireError::ConnectFailed("Gateway token contains invalid characters".to_string())
            })?;
            request.headers_mut().insert(AUTHORIZATION, bearer);
        }

        let connector = if config.allow_insecure_tls && url.scheme() == "wss" {
            warn!(gateway = %gateway_label(url), "TLS certificate verification disabled for gateway");
            Some(Connector::Rustls(insecure_tls_config()?))
        } else {
            None
        };

        debug!(gateway = %gateway_label(url), "Opening gateway WebSocket");
        let (stream, _) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
                .map_err(|e| {
                    WireError::ConnectFailed(format!("Failed to connect to gateway at {url}: {e}"))
                })?;

        let channel = RpcChannel::start(stream, gateway_label(url), self.rpc.ping_timeout());
        if let Err(e) = channel
            .call(CONNECT_METHOD, self.handshake_params(config), budget)
            .await
        {
            channel.close().await;
            return Err(WireError::ConnectFailed(format!(
                "Gateway handshake failed: {e}"
            )));
        }
        Ok(channel)
    }
}

#[async_trait]
impl GatewayConnector for WsConnector {
    async fn connect(&self, config: &GatewayConfig) -> Result<ConnectionHandle, WireError> {
        let url = normalize_gateway_url(&config.url)?;
        let budget = self.rpc.handshake_timeout();

        // Dropping `open` on timeout drops the channel, which aborts its tasks.
        match tokio::time::timeout(budget, self.open(&url, config, budget)).await {
            Ok(Ok(channel)) => {
                info!(
                    gateway = %gateway_label(&url),
                    connection = %channel.tag(),
                    "Gateway connection established"
                );
                Ok(Arc::new(channel))
            }
            Ok(Err(e)) => {
                warn!(gateway = %gateway_label(&url), error = %e, "Gateway connect failed");
                Err(e)
            }
            Err(_) => {
                warn!(gateway = %gateway_label(&url), "Gateway handshake timed out");
                Err(WireError::ConnectFailed(format!(
                    "Gateway handshake timed out after {}ms",
                    budget.as_millis()
                )))
            }
        }
    }
}

/// Parse a gateway URL, mapping `http(s)` onto `ws(s)`.
pub fn normalize_gateway_url(raw: &str) -> Result<Url, WireError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| WireError::ConnectFailed(format!("Invalid gateway URL '{raw}': {e}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(WireError::ConnectFailed(format!(
                "Invalid gateway URL '{raw}': unsupported scheme '{other}'"
            )))
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(WireError::ConnectFailed(format!(
            "Invalid gateway URL '{raw}': cannot use scheme '{scheme}'"
        )));
    }
    Ok(url)
}

/// `host[:port]` for logs; never includes credentials or query.
fn gateway_label(url: &Url) -> String {
    let host = url.host_str().unwrap_or("gateway");
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn insecure_tls_config() -> Result<Arc<rustls::ClientConfig>, WireError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| WireError::ConnectFailed(format!("TLS setup failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Skips certificate chain validation; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
