//! REST API server for the fan vault orchestrator
//!
//! Exposes the chat pipeline over HTTP: a batch chat endpoint, a streaming
//! variant, a fan-token balance lookup, and a health probe. Errors are
//! serialized as `{ "error": "<message>" }` with the status the error type
//! maps to; internals never leak.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::chain::token_info;
use crate::error::ChatError;
use crate::orchestrator::{ChatOrchestrator, ChatRequest};

/// Fragments buffered between producer and HTTP writer before the
/// producer blocks.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<ChatOrchestrator>,
}

/// =============================
/// Error Mapping
/// =============================

fn error_response(e: &ChatError) -> (StatusCode, Json<serde_json::Value>) {
    (
        e.status_code(),
        Json(serde_json::json!({ "error": e.public_message() })),
    )
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoints
/// =============================

/// GET probe on the chat route, for load balancers and manual checks.
async fn vault_chat_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "message": "POST chat messages to this endpoint"
    }))
}

async fn vault_chat(
    State(state): State<ApiState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    info!(vault_id = ?request.vault_id, "Received vault chat request");

    match state.orchestrator.chat(request).await {
        Ok(text) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true, "response": text })),
        )
            .into_response(),
        Err(e) => {
            error!("Chat request failed: {}", e);
            error_response(&e).into_response()
        }
    }
}

/// Streaming chat. Validation and vault lookup run before the body is
/// committed so those failures keep their proper statuses; anything that
/// fails after streaming starts is written into the body as an in-band
/// `[error: ...]` marker.
async fn vault_chat_stream(
    State(state): State<ApiState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    info!(vault_id = ?request.vault_id, "Received streaming chat request");

    if let Err(e) = state.orchestrator.check_request(request.clone()).await {
        error!("Stream pre-flight failed: {}", e);
        return error_response(&e).into_response();
    }

    let (tx, rx) = mpsc::channel::<String>(STREAM_CHANNEL_CAPACITY);

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        match orchestrator.chat_stream(request, tx.clone()).await {
            Ok(()) => {}
            Err(ChatError::StreamClosed) => {
                info!("Stream consumer disconnected; producer stopped");
            }
            Err(e) => {
                warn!("Stream producer failed: {}", e);
                let _ = tx.send(format!("\n[error: {}]", e.public_message())).await;
            }
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<String, Infallible>));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// =============================
/// Fan-Token Balance Endpoint
/// =============================

#[derive(Debug, Deserialize)]
struct FanTokenQuery {
    address: Option<String>,
    club: Option<String>,
}

async fn fan_tokens(
    State(state): State<ApiState>,
    Query(query): Query<FanTokenQuery>,
) -> Response {
    let (Some(address), Some(club)) = (query.address, query.club) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "address and club query parameters are required"
            })),
        )
            .into_response();
    };

    if token_info(&club).is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("Unsupported club: {}", club)
            })),
        )
            .into_response();
    }

    match state.orchestrator.agent().token_balance(&club, &address).await {
        Ok(balance) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "club": club.to_uppercase(),
                "address": address,
                "balance": balance
            })),
        )
            .into_response(),
        Err(e) => {
            error!("Fan-token lookup failed: {}", e);
            error_response(&e).into_response()
        }
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<ChatOrchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/vault-chat", get(vault_chat_info).post(vault_chat))
        .route("/api/vault-chat/stream", post(vault_chat_stream))
        .route("/api/fan-tokens", get(fan_tokens))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<ChatOrchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
