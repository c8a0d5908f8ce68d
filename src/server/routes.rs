//! HTTP handlers for the per-agent server.

use std::sync::{Arc, OnceLock};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Notify;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::orchestrator::Orchestrator;

/// Delay between answering `POST /stop` and shutting down, so the response
/// can flush.
const STOP_GRACE_MS: u64 = 100;

// ─── State ───────────────────────────────────────────────────────────────────

pub struct ServerState {
    pub agent_id: String,
    pub port: u16,
    pub workspace: std::path::PathBuf,
    pub sessions_dir: std::path::PathBuf,
    pub memory_dir: std::path::PathBuf,
    pub orchestrator: Arc<Orchestrator>,
    /// Signalled by `POST /stop` to begin graceful shutdown.
    pub stop: Arc<Notify>,
}

pub type SharedState = Arc<ServerState>;

/// Build the agent server's router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/chat", post(chat))
        .route("/sessions", get(sessions))
        .route("/stop", post(stop))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "agent": state.agent_id }))
}

async fn info(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "id": state.agent_id,
        "status": "running",
        "port": state.port,
        "pid": std::process::id(),
        "workspace": state.workspace,
        "sessionsDir": state.sessions_dir,
        "memoryDir": state.memory_dir,
        "activeSessions": state.orchestrator.sessions().session_count(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: String,
}

async fn chat(
    State(state): State<SharedState>,
    Json(request): Json<ChatRequest>,
) -> impl IntoResponse {
    let message = match request.message.as_deref().map(str::trim) {
        Some(message) if !message.is_empty() => message.to_owned(),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "message is required" })),
            )
                .into_response();
        }
    };
    let session_id = harden_session_id(request.session_id.as_deref());

    match state.orchestrator.turn("http", &session_id, &message).await {
        Ok(response) => Json(ChatResponse {
            response,
            session_id,
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn sessions(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({ "sessions": state.orchestrator.sessions().list_sessions() }))
}

async fn stop(State(state): State<SharedState>) -> impl IntoResponse {
    log::info!("[server] stop requested");
    let notify = Arc::clone(&state.stop);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(STOP_GRACE_MS)).await;
        notify.notify_waiters();
    });
    Json(json!({ "status": "stopping" }))
}

// ─── Session-id hardening ────────────────────────────────────────────────────

/// Compute the effective session id for a `/chat` request.
///
/// Omitted ids get a fresh `session-<16 hex>`. Ids already carrying a
/// 16-hex-char suffix are trusted verbatim; anything else gets a random
/// suffix appended so a caller cannot collide with another caller's chosen
/// id.
pub fn harden_session_id(raw: Option<&str>) -> String {
    static TRUSTED: OnceLock<Regex> = OnceLock::new();
    let trusted = TRUSTED.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^.+-[0-9a-f]{16}$").expect("static pattern")
    });

    match raw {
        None | Some("") => format!("session-{}", random_hex16()),
        Some(id) if trusted.is_match(id) => id.to_owned(),
        Some(id) => format!("{id}-{}", random_hex16()),
    }
}

/// 16 hex characters from a cryptographically strong source.
fn random_hex16() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_owned()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
