//! HTTP route handlers for the gateway API.

use crate::facade::{unsupported_action, ActionInput, GatewayAction, GatewayFacade};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gatehouse_types::{GatehouseError, GatehouseResult};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Shared state for route handlers.
pub struct AppState {
    pub facade: GatewayFacade,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcQuery {
    pub action: Option<String>,
    pub session_key: Option<String>,
}

/// Build the API router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/gateways/pool", get(pool_stats))
        .route("/api/gateways/{id}/rpc", get(rpc_read).post(rpc_write))
        .route("/api/gateways/{id}/provision", post(provision))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /api/health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/gateways/pool
pub async fn pool_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.facade.pool_stats())
}

/// GET /api/gateways/{id}/rpc?action=sessions|history
pub async fn rpc_read(
    State(state): State<Arc<AppState>>,
    Path(gateway_id): Path<String>,
    Query(query): Query<RpcQuery>,
) -> Response {
    let action = match parse_action(query.action.as_deref(), false) {
        Ok(action) => action,
        Err(e) => return error_response(&gateway_id, e),
    };
    let input = ActionInput {
        session_key: query.session_key,
        body: Value::Null,
    };
    respond(&gateway_id, state.facade.dispatch(action, &gateway_id, input).await)
}

/// POST /api/gateways/{id}/rpc?action=send|provision
pub async fn rpc_write(
    State(state): State<Arc<AppState>>,
    Path(gateway_id): Path<String>,
    Query(query): Query<RpcQuery>,
    body: Bytes,
) -> Response {
    let action = match parse_action(query.action.as_deref(), true) {
        Ok(action) => action,
        Err(e) => return error_response(&gateway_id, e),
    };
    let body = match parse_body(&body) {
        Ok(body) => body,
        Err(e) => return error_response(&gateway_id, e),
    };
    let input = ActionInput {
        session_key: query.session_key,
        body,
    };
    respond(&gateway_id, state.facade.dispatch(action, &gateway_id, input).await)
}

/// POST /api/gateways/{id}/provision
pub async fn provision(
    State(state): State<Arc<AppState>>,
    Path(gateway_id): Path<String>,
    body: Bytes,
) -> Response {
    let body = match parse_body(&body) {
        Ok(body) => body,
        Err(e) => return error_response(&gateway_id, e),
    };
    let input = ActionInput {
        session_key: None,
        body,
    };
    respond(
        &gateway_id,
        state
            .facade
            .dispatch(GatewayAction::Provision, &gateway_id, input)
            .await,
    )
}

/// Parse `?action=`, rejecting actions served on the other HTTP method.
fn parse_action(raw: Option<&str>, write: bool) -> GatehouseResult<GatewayAction> {
    let raw = raw.unwrap_or_default();
    let action: GatewayAction = raw.parse()?;
    if action.is_write() != write {
        return Err(unsupported_action(raw));
    }
    Ok(action)
}

/// An empty body is `Null`; anything else must be JSON.
fn parse_body(body: &[u8]) -> GatehouseResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|e| GatehouseError::Validation(format!("Invalid JSON body: {e}")))
}

fn respond(gateway_id: &str, result: GatehouseResult<Value>) -> Response {
    match result {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => error_response(gateway_id, e),
    }
}

fn error_response(gateway_id: &str, error: GatehouseError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(gateway_id, error = %error, "Gateway request failed");
    } else {
        debug!(gateway_id, status = status.as_u16(), error = %error, "Gateway request rejected");
    }
    (
        status,
        Json(serde_json::json!({ "error": error.to_string() })),
    )
        .into_response()
}
