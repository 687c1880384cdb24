//! HTTP server implementation using Axum.

use crate::error::Error;
use crate::state::spawn_reaper;
use crate::tools::{SessionInfo, Tools};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub tools: Arc<Tools>,
}

type ApiError = (StatusCode, String);

// Request/Response types
#[derive(Deserialize)]
struct RunCodeRequest {
    code: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct EphemeralRequest {
    code: String,
}

#[derive(Deserialize)]
struct RunFileRequest {
    path: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct CopyInRequest {
    local_path: String,
    #[serde(default)]
    container_path: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    workdir: Option<String>,
}

#[derive(Deserialize)]
struct CopyOutRequest {
    container_path: String,
    #[serde(default)]
    local_path: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    workdir: Option<String>,
}

#[derive(Deserialize)]
struct EditFileRequest {
    container_path: String,
    content: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct ToolResponse {
    output: String,
}

#[derive(Serialize)]
struct SessionResponse {
    session_id: String,
}

fn reply(output: String) -> Json<ToolResponse> {
    Json(ToolResponse { output })
}

pub(crate) fn status_of(err: &Error) -> StatusCode {
    match err {
        Error::InvalidPath { .. } => StatusCode::BAD_REQUEST,
        Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
        Error::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::Container(_) => StatusCode::BAD_GATEWAY,
        Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: Error) -> ApiError {
    (status_of(&err), err.to_string())
}

/// Build the router over the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Session management
        .route("/sessions", post(init))
        .route("/sessions", get(list_sessions))
        .route("/sessions/current", get(get_current))
        .route("/sessions/current", post(new_current))
        .route("/sessions/current", delete(close_current))
        .route("/sessions/:id", delete(close_session))
        // Execution and files
        .route("/run", post(run_code))
        .route("/run/ephemeral", post(run_code_ephemeral))
        .route("/run-file", post(run_file))
        .route("/cp-in", post(cp_in))
        .route("/cp-out", post(cp_out))
        .route("/files", post(edit_file))
        // Container
        .route("/packages", get(list_packages))
        .route("/reset", post(reset))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port, sweeping expired sessions every
/// `reap_interval` in the background.
pub async fn run_server(port: u16, state: AppState, reap_interval: Duration) -> std::io::Result<()> {
    let reaper = spawn_reaper(state.tools.coordinator().store().clone(), reap_interval);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, router(state)).await;
    reaper.abort();
    served
}

async fn health() -> &'static str {
    "OK"
}

async fn init(State(state): State<AppState>) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = state.tools.init().await.map_err(api_error)?;
    Ok(Json(SessionResponse { session_id }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.tools.list_sessions().await)
}

async fn get_current(State(state): State<AppState>) -> Json<SessionResponse> {
    Json(SessionResponse {
        session_id: state.tools.get_current_session().await,
    })
}

async fn new_current(State(state): State<AppState>) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = state.tools.new_current_session().await.map_err(api_error)?;
    Ok(Json(SessionResponse { session_id }))
}

async fn close_current(State(state): State<AppState>) -> Json<ToolResponse> {
    reply(state.tools.close_current_session().await)
}

async fn close_session(State(state): State<AppState>, Path(id): Path<String>) -> Json<ToolResponse> {
    info!("DELETE /sessions/{}", id);
    reply(state.tools.close_session(&id).await)
}

async fn run_code(
    State(state): State<AppState>,
    Json(req): Json<RunCodeRequest>,
) -> Result<Json<ToolResponse>, ApiError> {
    state
        .tools
        .run_code(&req.code, req.session_id.as_deref())
        .await
        .map(reply)
        .map_err(api_error)
}

async fn run_code_ephemeral(
    State(state): State<AppState>,
    Json(req): Json<EphemeralRequest>,
) -> Result<Json<ToolResponse>, ApiError> {
    state
        .tools
        .run_code_ephemeral(&req.code)
        .await
        .map(reply)
        .map_err(api_error)
}

async fn run_file(
    State(state): State<AppState>,
    Json(req): Json<RunFileRequest>,
) -> Result<Json<ToolResponse>, ApiError> {
    state
        .tools
        .run_file(&req.path, req.session_id.as_deref())
        .await
        .map(reply)
        .map_err(api_error)
}

async fn cp_in(
    State(state): State<AppState>,
    Json(req): Json<CopyInRequest>,
) -> Result<Json<ToolResponse>, ApiError> {
    state
        .tools
        .cp_in(
            &req.local_path,
            req.container_path.as_deref(),
            req.session_id.as_deref(),
            req.workdir.as_deref(),
        )
        .await
        .map(reply)
        .map_err(api_error)
}

async fn cp_out(
    State(state): State<AppState>,
    Json(req): Json<CopyOutRequest>,
) -> Result<Json<ToolResponse>, ApiError> {
    state
        .tools
        .cp_out(
            &req.container_path,
            req.local_path.as_deref(),
            req.session_id.as_deref(),
            req.workdir.as_deref(),
        )
        .await
        .map(reply)
        .map_err(api_error)
}

async fn edit_file(
    State(state): State<AppState>,
    Json(req): Json<EditFileRequest>,
) -> Result<Json<ToolResponse>, ApiError> {
    state
        .tools
        .edit_file(&req.container_path, &req.content, req.session_id.as_deref())
        .await
        .map(reply)
        .map_err(api_error)
}

async fn list_packages(State(state): State<AppState>) -> Result<Json<ToolResponse>, ApiError> {
    state.tools.list_packages().await.map(reply).map_err(api_error)
}

async fn reset(State(state): State<AppState>) -> Result<Json<ToolResponse>, ApiError> {
    info!("POST /reset");
    state.tools.reset().await.map(reply).map_err(api_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_distinct_statuses() {
        let cases = [
            (Error::invalid_path("../x", "path escapes its root"), StatusCode::BAD_REQUEST),
            (Error::SessionNotFound("abc".to_string()), StatusCode::NOT_FOUND),
            (Error::CapacityExceeded { max: 1 }, StatusCode::TOO_MANY_REQUESTS),
            (Error::Container(anyhow::anyhow!("docker gone")), StatusCode::BAD_GATEWAY),
        ];
        for (err, status) in cases {
            assert_eq!(status_of(&err), status);
        }
    }

    #[test]
    fn container_errors_keep_stable_prefix() {
        let (status, body) = api_error(Error::Container(anyhow::anyhow!("docker gone")));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.starts_with("container operation failed"));
    }
}
