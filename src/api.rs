//! HTTP surface for scanpipe.
//!
//! This module exposes a compact Axum router with the upload and job
//! endpoints:
//!
//! - `POST /upload` – Register a chunked upload session; returns the session
//!   id, negotiated chunk size, and expected chunk count.
//! - `POST /chunk` – Ingest one base64-encoded chunk; the final chunk
//!   triggers reassembly before the response is produced.
//! - `POST /process` – Submit a completed session's artifact to the scan
//!   pipeline; returns a job id immediately.
//! - `GET /status/{job_id}` – Poll a job snapshot until a terminal state.
//! - `DELETE /job/{job_id}` – Cooperatively cancel a pending or active job.
//! - `GET /metrics` – Observe activity counters.
//! - `GET /health` – Liveness probe.
//!
//! Every request is admitted through the global rate limiter plus the named
//! policy for its endpoint; the client key is the first `x-forwarded-for`
//! hop, falling back to `"local"`.

use crate::job::{Job, JobEngine, JobError};
use crate::metrics::{MetricsSnapshot, ServiceMetrics};
use crate::ratelimit::RateLimiter;
use crate::upload::{SessionManager, UploadError};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Named admission policies shared by the handlers.
pub struct RateLimiters {
    /// Coarse per-client ceiling across all endpoints.
    pub global: RateLimiter,
    /// Wider allowance for the chunk upload endpoints.
    pub upload: RateLimiter,
    /// Tighter allowance for the processing endpoint.
    pub process: RateLimiter,
}

/// Shared state handed to every handler.
pub struct AppState {
    /// Upload session store.
    pub sessions: Arc<SessionManager>,
    /// Scan job engine.
    pub jobs: Arc<JobEngine>,
    /// Admission policies.
    pub limiters: RateLimiters,
    /// Activity counters.
    pub metrics: Arc<ServiceMetrics>,
}

/// Build the HTTP router exposing the upload and job API surface.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/upload", post(create_upload))
        .route("/chunk", post(ingest_chunk))
        .route("/process", post(submit_job))
        .route("/status/:job_id", get(job_status))
        .route("/job/:job_id", delete(cancel_job))
        .route("/metrics", get(get_metrics))
        .route("/health", get(health))
        .with_state(state)
}

/// Request body for `POST /upload`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUploadRequest {
    /// Client-side file name.
    filename: String,
    /// Total upload size in bytes.
    declared_size: u64,
    /// Optional chunk size override.
    #[serde(default)]
    chunk_size: Option<u64>,
}

/// Success response for `POST /upload`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateUploadResponse {
    upload_id: Uuid,
    chunk_size: u64,
    max_chunks: u32,
}

/// Register a new chunked upload session.
async fn create_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateUploadRequest>,
) -> Result<Json<CreateUploadResponse>, ApiError> {
    admit(&state, &headers, &state.limiters.upload)?;
    let session = state
        .sessions
        .create_session(&request.filename, request.declared_size, request.chunk_size)
        .await?;
    state.metrics.record_session();
    Ok(Json(CreateUploadResponse {
        upload_id: session.id,
        chunk_size: session.chunk_size,
        max_chunks: session.expected_chunks,
    }))
}

/// Request body for `POST /chunk`. Chunk bytes travel base64-encoded.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkRequest {
    upload_id: Uuid,
    chunk_index: u32,
    total_chunks: u32,
    data: String,
}

/// Success response for `POST /chunk`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkResponse {
    received_chunks: u32,
    total_chunks: u32,
    complete: bool,
}

/// Ingest one chunk; the final chunk reassembles the artifact synchronously.
async fn ingest_chunk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChunkRequest>,
) -> Result<Json<ChunkResponse>, ApiError> {
    admit(&state, &headers, &state.limiters.upload)?;
    let bytes = BASE64_STANDARD
        .decode(&request.data)
        .map_err(|err| ApiError::InvalidInput(format!("chunk data is not valid base64: {err}")))?;
    let receipt = state
        .sessions
        .ingest_chunk(
            request.upload_id,
            request.chunk_index,
            request.total_chunks,
            &bytes,
        )
        .await?;
    state.metrics.record_chunk();
    if receipt.complete {
        tracing::info!(session = %request.upload_id, "Final chunk received, artifact assembled");
    }
    Ok(Json(ChunkResponse {
        received_chunks: receipt.received,
        total_chunks: receipt.expected,
        complete: receipt.complete,
    }))
}

/// Request body for `POST /process`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessRequest {
    upload_id: Uuid,
}

/// Success response for `POST /process`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessResponse {
    job_id: Uuid,
}

/// Submit a completed upload for asynchronous processing.
async fn submit_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ProcessRequest>,
) -> Result<Json<ProcessResponse>, ApiError> {
    admit(&state, &headers, &state.limiters.process)?;
    let job_id = state.jobs.submit(&state.sessions, request.upload_id).await?;
    Ok(Json(ProcessResponse { job_id }))
}

/// Return a consistent job snapshot for polling clients.
async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = state.jobs.get_status(job_id).await?;
    Ok(Json(job))
}

/// Response body for `DELETE /job/{job_id}`.
#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

/// Cancel a pending or active job.
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    state.jobs.cancel(job_id).await?;
    Ok(Json(CancelResponse { cancelled: true }))
}

/// Return activity counters for observability dashboards.
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Resolve the rate-limiting key for a request.
fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

/// Admit a request through the global policy and the endpoint's policy.
fn admit(state: &AppState, headers: &HeaderMap, policy: &RateLimiter) -> Result<(), ApiError> {
    let key = client_key(headers);
    for limiter in [&state.limiters.global, policy] {
        let decision = limiter.admit(&key);
        if !decision.allowed {
            return Err(ApiError::RateLimited {
                retry_after: decision.retry_after.unwrap_or_default(),
            });
        }
    }
    Ok(())
}

/// API-level error with a stable machine-readable code.
#[derive(Debug)]
enum ApiError {
    InvalidInput(String),
    NotFound(String),
    InvalidState(String),
    IncompleteUpload(String),
    RateLimited { retry_after: Duration },
    Internal(String),
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::InvalidInput(_) | UploadError::ChunkOutOfRange { .. } => {
                Self::InvalidInput(err.to_string())
            }
            UploadError::SessionNotFound(_) => Self::NotFound(err.to_string()),
            UploadError::InvalidState { .. } => Self::InvalidState(err.to_string()),
            UploadError::IncompleteUpload { .. } => Self::IncompleteUpload(err.to_string()),
            UploadError::Io(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            // The submit contract reports both unknown and incomplete
            // sessions as 404 to the caller.
            JobError::NotFound(_)
            | JobError::SessionNotFound(_)
            | JobError::SessionNotReady(_) => Self::NotFound(err.to_string()),
            JobError::InvalidState { .. } => Self::InvalidState(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, retry_after_ms) = match self {
            Self::InvalidInput(message) => {
                (StatusCode::BAD_REQUEST, "invalid_input", message, None)
            }
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message, None),
            Self::InvalidState(message) => (StatusCode::CONFLICT, "invalid_state", message, None),
            Self::IncompleteUpload(message) => {
                (StatusCode::CONFLICT, "incomplete_upload", message, None)
            }
            Self::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "request rate limit exceeded".to_string(),
                Some(retry_after.as_millis() as u64),
            ),
            Self::Internal(message) => {
                tracing::error!(error = %message, "Internal error serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal server error".to_string(),
                    None,
                )
            }
        };
        let mut body = json!({ "error": code, "message": message });
        if let Some(wait) = retry_after_ms {
            body["retryAfterMs"] = json!(wait);
        }
        (status, Json(body)).into_response()
    }
}
