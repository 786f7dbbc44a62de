use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use flagforge_common::{RunId, RunInput};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::RegistryError;
use crate::registry::RunRegistry;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: RunRegistry,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

/// Body of `POST /api/runs`.
#[derive(Debug, Deserialize)]
pub struct SubmitRunRequest {
    pub target_url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub source: Option<String>,
    pub flag_format: Option<String>,
    pub hint: Option<String>,
}

impl From<SubmitRunRequest> for RunInput {
    fn from(req: SubmitRunRequest) -> Self {
        RunInput {
            target_url: req.target_url,
            title: non_blank(req.title),
            description: non_blank(req.description),
            source: non_blank(req.source),
            flag_format: non_blank(req.flag_format),
            hint: non_blank(req.hint),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitRunResponse {
    pub run_id: RunId,
}

#[derive(Debug, Serialize)]
pub struct Ack {
    pub ok: bool,
    pub message: String,
}

impl Ack {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            ok: true,
            message: message.into(),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            RegistryError::AlreadyTerminal { .. } => ApiError::Conflict(err.to_string()),
            RegistryError::InvalidInput(_) => ApiError::BadRequest(err.to_string()),
            RegistryError::LockPoisoned => {
                warn!(error = %err, "registry unavailable");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

/// Unparseable ids cannot name a run, so they are reported as not found.
fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    raw.parse::<RunId>()
        .map_err(|_| ApiError::NotFound(format!("Run {} not found", raw)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", get(list_runs).post(submit_run))
        .route("/api/runs/{id}", get(get_run).delete(delete_run))
        .route("/api/runs/{id}/stop", post(stop_run))
        .route("/api/stats", get(get_stats))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn submit_run(
    State(state): State<SharedState>,
    Json(req): Json<SubmitRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = state.registry.submit(req.into()).await?;
    Ok((StatusCode::CREATED, Json(SubmitRunResponse { run_id })))
}

async fn list_runs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.list().await?))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_run_id(&id)?;
    Ok(Json(state.registry.get(id).await?))
}

async fn stop_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_run_id(&id)?;
    state.registry.stop(id).await?;
    Ok(Ack::new(format!("Stop requested for run {}", id)))
}

async fn delete_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_run_id(&id)?;
    state.registry.delete(id).await?;
    Ok(Ack::new(format!("Run {} deleted", id)))
}

async fn get_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.stats().await?))
}
