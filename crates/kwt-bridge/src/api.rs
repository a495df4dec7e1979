//! HTTP surface: router, shared state and the unified API error type.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use kwt_core::config::Config;
use kwt_core::types::{AuditAction, AuditEvent, PodRef};
use kwt_exec::{ExecError, ExecFactory};

use crate::audit::{record_best_effort, AuditSink};
use crate::upload::{self, UploadError};

/// Shared state handed to every handler.
pub struct ApiState {
    pub factory: Arc<ExecFactory>,
    pub audit: Arc<dyn AuditSink>,
    pub config: Config,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by the HTTP API layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ExecError> for ApiError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::PodNotFound { .. } => ApiError::NotFound(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::InvalidFilename => ApiError::BadRequest(e.to_string()),
            UploadError::TooLarge { .. } => ApiError::PayloadTooLarge(e.to_string()),
            UploadError::Exec(inner) => inner.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the full router: health, pod probe, upload, and the terminal
/// WebSocket endpoint.
pub fn router(state: Arc<ApiState>) -> Router {
    // Leave headroom over the file limit for multipart framing.
    let body_limit = (state.config.upload.max_bytes as usize).saturating_add(64 * 1024);
    Router::new()
        .route("/health", get(health))
        .route("/api/pods/{namespace}/{pod}", get(pod_info))
        .route("/api/upload/{namespace}/{pod}", post(upload_file))
        .route("/ws/terminal/{namespace}/{pod}", get(crate::ws::terminal_ws))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /api/pods/{namespace}/{pod} — cached existence probe.
async fn pod_info(
    State(state): State<Arc<ApiState>>,
    Path((namespace, pod)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let exists = state.factory.pod_exists(&namespace, &pod).await?;
    Ok(Json(json!({
        "namespace": namespace,
        "pod": pod,
        "exists": exists,
    })))
}

/// POST /api/upload/{namespace}/{pod} — multipart upload of a single file
/// into the pod's configured target directory.
async fn upload_file(
    State(state): State<Arc<ApiState>>,
    Path((namespace, pod)): Path<(String, String)>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut username = "unknown_user".to_string();
    let mut file: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                file = Some((filename, data.to_vec()));
            }
            Some("username") => {
                username = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            }
            _ => {}
        }
    }

    let (filename, content) = file.ok_or_else(|| {
        ApiError::BadRequest("multipart request is missing the \"file\" field".to_string())
    })?;

    let pod_ref = PodRef::new(&namespace, &pod);
    record_best_effort(
        state.audit.as_ref(),
        &AuditEvent::now(username.as_str(), &pod_ref, AuditAction::UploadAttempted),
    )
    .await;

    info!(%namespace, %pod, %username, %filename, bytes = content.len(), "upload requested");
    let outcome = upload::upload(
        &state.factory,
        &state.config.upload,
        &namespace,
        &pod,
        &filename,
        &content,
    )
    .await?;

    Ok(Json(json!({
        "path": outcome.remote_path,
        "bytes": outcome.bytes,
    })))
}
