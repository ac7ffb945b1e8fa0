//! HTTP management surface for the WiFi gateway.
//!
//! Every handler is a thin adapter over [`GatewayHandle`]; the gateway loop
//! stays the only owner of its state.
//!
//! | Method | Path | Action |
//! |---|---|---|
//! | GET | `/api/nodes` | node registry view |
//! | GET | `/api/stats` | gateway, OTA and process counters |
//! | GET | `/api/manifest` | cached manifest and its age |
//! | POST | `/api/manifest/refresh` | drop the cache and refetch |
//! | POST | `/api/ota/trigger` | `{"node_id": N}` manual OTA |
//! | POST | `/api/ota/cancel` | `{"node_id": N}` abort a transfer |
//! | POST | `/api/ota/auto/toggle` | flip automatic OTA |
//! | GET | `/api/ota/sessions` | in-flight transfers |
use anyhow::{anyhow, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::info;
use serde::{Deserialize, Serialize};

use crate::errors::QuakeError;
use crate::roles::{wait_shutdown, GatewayHandle, ShutdownRx};
use crate::transport::NodeId;

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<QuakeError> for ApiError {
    fn from(err: QuakeError) -> Self {
        let code = match &err {
            QuakeError::UnknownNode(_) | QuakeError::NoFirmware(_) => 404,
            QuakeError::SessionActive(_) => 409,
            QuakeError::DigestMismatch { .. } => 422,
            QuakeError::Manifest(_) | QuakeError::Download(_) | QuakeError::Http(_) => 502,
            QuakeError::LoopClosed => 503,
            _ => 500,
        };
        Self {
            error: err.to_string(),
            code,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NodeRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Serialize)]
struct AutoOtaState {
    auto_ota: bool,
}

#[derive(Debug, Serialize)]
struct CancelState {
    node_id: NodeId,
    cancelled: bool,
}

pub fn router(handle: GatewayHandle) -> Router {
    Router::new()
        .route("/api/nodes", get(nodes))
        .route("/api/stats", get(stats))
        .route("/api/manifest", get(manifest))
        .route("/api/manifest/refresh", post(refresh_manifest))
        .route("/api/ota/trigger", post(trigger_ota))
        .route("/api/ota/cancel", post(cancel_ota))
        .route("/api/ota/auto/toggle", post(toggle_auto))
        .route("/api/ota/sessions", get(sessions))
        .with_state(handle)
}

async fn nodes(State(h): State<GatewayHandle>) -> Result<Response, ApiError> {
    Ok(Json(h.nodes().await?).into_response())
}

async fn stats(State(h): State<GatewayHandle>) -> Result<Response, ApiError> {
    Ok(Json(h.stats().await?).into_response())
}

async fn manifest(State(h): State<GatewayHandle>) -> Result<Response, ApiError> {
    match h.manifest().await? {
        Some(view) => Ok(Json(view).into_response()),
        None => Err(ApiError {
            error: "manifest not fetched yet".into(),
            code: 404,
        }),
    }
}

async fn refresh_manifest(State(h): State<GatewayHandle>) -> Result<Response, ApiError> {
    Ok(Json(h.refresh_manifest().await?).into_response())
}

async fn trigger_ota(State(h): State<GatewayHandle>, Json(req): Json<NodeRequest>) -> Result<Response, ApiError> {
    let session = h.trigger_ota(req.node_id).await?;
    Ok((StatusCode::ACCEPTED, Json(session)).into_response())
}

async fn cancel_ota(State(h): State<GatewayHandle>, Json(req): Json<NodeRequest>) -> Result<Response, ApiError> {
    let cancelled = h.cancel_ota(req.node_id).await?;
    Ok(Json(CancelState {
        node_id: req.node_id,
        cancelled,
    })
    .into_response())
}

async fn toggle_auto(State(h): State<GatewayHandle>) -> Result<Response, ApiError> {
    let auto_ota = h.toggle_auto_ota().await?;
    Ok(Json(AutoOtaState { auto_ota }).into_response())
}

async fn sessions(State(h): State<GatewayHandle>) -> Result<Response, ApiError> {
    Ok(Json(h.sessions().await?).into_response())
}

/// Serve the management API on `bind` until shutdown is requested.
pub async fn serve(bind: &str, handle: GatewayHandle, mut shutdown: ShutdownRx) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| anyhow!("Failed to bind management API on {}: {}", bind, e))?;
    info!("Management API: http://{}", bind);
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move { wait_shutdown(&mut shutdown).await })
        .await
        .map_err(|e| anyhow!("Management API error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        let e: ApiError = QuakeError::SessionActive(NodeId(3)).into();
        assert_eq!(e.code, 409);
        let e: ApiError = QuakeError::UnknownNode(NodeId(3)).into();
        assert_eq!(e.code, 404);
        let e: ApiError = QuakeError::LoopClosed.into();
        assert_eq!(e.code, 503);
    }

    #[test]
    fn node_request_accepts_string_id() {
        let r: NodeRequest = serde_json::from_str(r#"{"node_id":"42"}"#).unwrap();
        assert_eq!(r.node_id, NodeId(42));
    }
}
