//! Herald HTTP API
//!
//! Axum-based HTTP surface for chat front ends and operators.
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, serde_json::Value)`, so the logic is testable
//! without going through the router.
//!
//! Endpoints:
//! - GET  /health                  : DB, client and sync stream status
//! - POST /chat                    : reply on the user's stored session
//! - POST /sessions/:user_id/reset : start the user on a fresh session

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use herald_core::config::HttpConfig;
use herald_core::{
    ClientError, ErrorClass, ServiceClient, SessionError, SessionRegistry, DEGRADED_REPLY_TEXT,
};
use herald_sync::ContentSyncScheduler;
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub pool: SqlitePool,
    pub client: Arc<ServiceClient>,
    pub registry: SessionRegistry,
    /// Absent when content sync is disabled.
    pub scheduler: Option<Arc<ContentSyncScheduler>>,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/chat", post(chat_handler))
        .route("/sessions/:user_id/reset", post(reset_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    config: &HttpConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Herald HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ChatRequest {
    pub user_id: Option<String>,
    pub message: Option<String>,
    pub context: Option<String>,
}

fn error_body(msg: impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({
        "error": msg.to_string(),
        "status": "error",
    })
}

/// Non-fatal upstream failures surface as 503, fatal ones as 502.
fn upstream_status(err: &ClientError) -> StatusCode {
    match err.class() {
        ErrorClass::Fatal => StatusCode::BAD_GATEWAY,
        ErrorClass::Retryable | ErrorClass::SessionInvalid => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn session_error(err: SessionError) -> (StatusCode, serde_json::Value) {
    match err {
        SessionError::Upstream(e) => {
            tracing::error!(class = ?e.class(), error = %e, "Upstream session call failed");
            (upstream_status(&e), error_body(e))
        }
        SessionError::Database(e) => {
            tracing::error!(error = %e, "Session registry unavailable");
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e))
        }
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check: 503 only when the database is unreachable.
pub async fn health_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    let sqlite_ver = match herald_core::db::health_check(&state.pool).await {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                }),
            );
        }
    };

    let streams = state
        .scheduler
        .as_ref()
        .map(|s| s.status())
        .unwrap_or_default();

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "sqlite": sqlite_ver,
            "client": {
                "open": state.client.is_open().await,
                "in_flight": state.client.in_flight(),
                "concurrency": state.client.concurrency(),
            },
            "sync_enabled": state.scheduler.is_some(),
            "streams": streams,
        }),
    )
}

/// Inner chat: resolves the user's session, asks the upstream, and records
/// any fresh session the reply came back on.
pub async fn chat_inner(state: &HttpState, req: ChatRequest) -> (StatusCode, serde_json::Value) {
    let user_id = match req.user_id {
        Some(u) if !u.trim().is_empty() => u,
        _ => return (StatusCode::BAD_REQUEST, error_body("user_id field is required")),
    };
    let message = match req.message {
        Some(m) if !m.trim().is_empty() => m,
        _ => return (StatusCode::BAD_REQUEST, error_body("message field is required")),
    };

    let start = Instant::now();
    let session = match state.registry.get_or_create(&user_id, &state.client).await {
        Ok(s) => s,
        Err(SessionError::Upstream(e)) if e.class() != ErrorClass::Fatal => {
            tracing::error!(user_id = %user_id, error = %e, "No session available, replying degraded");
            return (
                StatusCode::OK,
                serde_json::json!({
                    "text": DEGRADED_REPLY_TEXT,
                    "degraded": true,
                    "session_id": serde_json::Value::Null,
                    "took_ms": start.elapsed().as_millis() as u64,
                }),
            );
        }
        Err(e) => return session_error(e),
    };

    let reply = match state
        .client
        .get_response(&session, &message, req.context.as_deref())
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(user_id = %user_id, session = %session.id, error = %e, "Chat request failed");
            return (upstream_status(&e), error_body(e));
        }
    };

    if let Some(fresh) = &reply.fresh_session {
        if let Err(e) = state.registry.replace(&user_id, fresh).await {
            tracing::warn!(user_id = %user_id, error = %e, "Could not persist fresh session");
        }
    }

    let session_id = reply
        .fresh_session
        .as_ref()
        .map(|s| s.id.clone())
        .unwrap_or(session.id);
    (
        StatusCode::OK,
        serde_json::json!({
            "text": reply.text,
            "degraded": reply.is_degraded(),
            "session_id": session_id,
            "took_ms": start.elapsed().as_millis() as u64,
        }),
    )
}

/// Inner reset: replaces the stored session with a new upstream one.
pub async fn reset_inner(state: &HttpState, user_id: &str) -> (StatusCode, serde_json::Value) {
    if user_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, error_body("user_id is required"));
    }
    match state.registry.reset(user_id, &state.client).await {
        Ok(session) => (
            StatusCode::OK,
            serde_json::json!({
                "user_id": user_id,
                "session_id": session.id,
                "created_at": session.created_at,
            }),
        ),
        Err(e) => session_error(e),
    }
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn chat_handler(
    State(state): State<Arc<HttpState>>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    let (status, body) = chat_inner(&state, req).await;
    (status, Json(body))
}

pub async fn reset_handler(
    State(state): State<Arc<HttpState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let (status, body) = reset_inner(&state, &user_id).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
