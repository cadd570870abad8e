//! HTTP gateway: connection status for the pairing front-end, outbound
//! sends, health and signed media downloads.

use crate::blob::LocalBlobStore;
use crate::config::GatewayConfig;
use crate::outbound::OutboundSender;
use crate::session::Session;
use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;

#[derive(Clone)]
pub struct GatewayState {
    pub session: Arc<Session>,
    pub outbound: Arc<OutboundSender>,
    pub blobs: Arc<LocalBlobStore>,
}

pub fn build_router(state: GatewayState, config: &GatewayConfig) -> Router {
    Router::new()
        .route("/api/whatsapp/status", get(handle_status))
        .route("/api/send/text", post(handle_send_text))
        .route("/api/send/audio", post(handle_send_audio))
        .route("/health", get(handle_health))
        .route("/media/{*path}", get(handle_media))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_gateway(host: &str, port: u16, state: GatewayState, config: &GatewayConfig) -> Result<()> {
    let listener = TcpListener::bind(format!("{host}:{port}"))
        .await
        .with_context(|| format!("Failed to bind gateway to {host}:{port}"))?;
    let addr = listener.local_addr()?;
    tracing::info!("Gateway listening on http://{addr}");

    crate::health::mark_component_ok("gateway");
    axum::serve(listener, build_router(state, config))
        .await
        .context("Gateway server stopped")
}

// ── Response helpers ─────────────────────────────────────────────

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn ok_json() -> ApiResponse {
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}

fn err_json(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(serde_json::json!({ "error": message })))
}

// ── Handlers ─────────────────────────────────────────────────────

async fn handle_status(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.session.snapshot())
}

async fn handle_health() -> impl IntoResponse {
    Json(crate::health::snapshot_json())
}

#[derive(Debug, Deserialize)]
struct SendTextBody {
    phone: String,
    text: String,
}

async fn handle_send_text(
    State(state): State<GatewayState>,
    Json(body): Json<SendTextBody>,
) -> ApiResponse {
    match state.outbound.send_text(&body.phone, &body.text).await {
        Ok(_) => ok_json(),
        Err(e) => {
            tracing::warn!("Text send to {} failed: {e}", body.phone);
            err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendAudioBody {
    phone: String,
    file_path: PathBuf,
}

async fn handle_send_audio(
    State(state): State<GatewayState>,
    Json(body): Json<SendAudioBody>,
) -> ApiResponse {
    match state.outbound.send_audio(&body.phone, &body.file_path).await {
        Ok(_) => ok_json(),
        Err(e) => {
            tracing::warn!("Audio send to {} failed: {e}", body.phone);
            err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    expires: Option<i64>,
    signature: Option<String>,
}

async fn handle_media(
    State(state): State<GatewayState>,
    AxumPath(path): AxumPath<String>,
    Query(query): Query<MediaQuery>,
) -> Response {
    let (Some(expires), Some(signature)) = (query.expires, query.signature) else {
        return err_json(StatusCode::FORBIDDEN, "missing signature").into_response();
    };
    if !state.blobs.verify(&path, expires, &signature, Utc::now()) {
        return err_json(StatusCode::FORBIDDEN, "invalid or expired signature").into_response();
    }

    match state.blobs.read(&path).await {
        Ok(Some((bytes, content_type))) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type)],
            Body::from(bytes),
        )
            .into_response(),
        Ok(None) => err_json(StatusCode::NOT_FOUND, "not found").into_response(),
        Err(e) => {
            tracing::error!("Failed to read blob {path}: {e:#}");
            err_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to read media").into_response()
        }
    }
}
