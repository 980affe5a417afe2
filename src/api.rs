//! HTTP submission API.
//!
//! The data plane is object-store only: submissions carry object keys, never
//! file content. Three guards enforce that at the edge: multipart bodies are
//! rejected, the content type must be JSON, and the body is capped at 1 MiB.

use std::str::FromStr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::model::normalize_extension;
use crate::job::{ForwardSpec, InputForwardMode, Job, JobStatus, JobType};
use crate::job::JobStore;
use crate::queue::PendingQueue;
use crate::registry::AgentRegistry;

/// Submissions above this are rejected with 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Command lines above this are rejected with 400.
pub const MAX_COMMAND_CHARS: usize = crate::job::model::MAX_COMMAND_CHARS;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<AgentRegistry>,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn PendingQueue>,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/:job_id", get(get_job))
        .route("/api/agents/online", get(agents_online))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

/// Submission shape. `output_key`/`output_prefix` are accepted but the
/// canonical `jobs/{job_id}/{attempt_id}/` layout wins: values outside it
/// are silently overwritten during normalization.
#[derive(Debug, Default, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub input_bucket: String,
    #[serde(default)]
    pub input_key: String,
    #[serde(default)]
    pub output_bucket: String,
    #[serde(default)]
    pub output_key: String,
    #[serde(default)]
    pub output_prefix: String,
    #[serde(default)]
    pub output_extension: String,
    #[serde(default)]
    pub attempt_id: i32,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub forward_url: String,
    #[serde(default)]
    pub forward_method: String,
    #[serde(default)]
    pub forward_headers: HashMap<String, String>,
    #[serde(default)]
    pub forward_body: String,
    #[serde(default)]
    pub forward_timeout_sec: u32,
    #[serde(default)]
    pub input_forward_mode: String,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

async fn create_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if content_type.starts_with("multipart/form-data") {
        return error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "multipart/form-data is not allowed; submit object-store keys as JSON",
        );
    }
    if !content_type.is_empty() && !content_type.starts_with("application/json") {
        return error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        );
    }
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "request body is required");
    }

    let request: CreateJobRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}"));
        }
    };

    if request.input_bucket.is_empty() != request.input_key.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "input_bucket and input_key must both be provided or both be empty",
        );
    }
    if request.command.len() > MAX_COMMAND_CHARS {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("command exceeds maximum length of {MAX_COMMAND_CHARS} characters"),
        );
    }

    let job_type = match JobType::from_str(request.job_type.trim().to_ascii_uppercase().as_str()) {
        Ok(job_type) => job_type,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "job_type must be COMMAND or FORWARD_HTTP",
            );
        }
    };
    let input_forward_mode = match InputForwardMode::from_str(
        request.input_forward_mode.trim().to_ascii_uppercase().as_str(),
    ) {
        Ok(mode) => mode,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "input_forward_mode must be URL or LOCAL_FILE",
            );
        }
    };
    if job_type == JobType::ForwardHttp && request.forward_url.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "forward_url is required for FORWARD_HTTP job_type",
        );
    }

    let mut job = Job::new(Uuid::new_v4().to_string());
    job.input_bucket = request.input_bucket;
    job.input_key = request.input_key;
    job.output_bucket = request.output_bucket;
    job.output_key = request.output_key;
    job.output_prefix = request.output_prefix;
    job.output_extension = normalize_extension(&request.output_extension);
    job.attempt_id = request.attempt_id.max(1);
    job.command = request.command;
    job.job_type = job_type;
    job.input_forward_mode = input_forward_mode;
    if job_type == JobType::ForwardHttp {
        job.forward = Some(ForwardSpec {
            url: request.forward_url.trim().to_string(),
            method: request.forward_method.trim().to_string(),
            headers: request.forward_headers,
            body: request.forward_body,
            timeout_sec: request.forward_timeout_sec,
        });
    }
    job.normalize_output_layout();

    if let Err(e) = job.validate() {
        return error_response(StatusCode::BAD_REQUEST, &format!("invalid job: {e}"));
    }

    if let Err(e) = state.store.create(&job).await {
        tracing::error!(job_id = %job.job_id, error = %e, "job creation failed");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to create job: {e}"),
        );
    }

    // The store is authoritative; a queue hiccup leaves the job recoverable.
    if let Err(e) = state.queue.enqueue(&job.job_id).await {
        tracing::warn!(job_id = %job.job_id, error = %e, "enqueue failed after create");
    } else {
        tracing::info!(job_id = %job.job_id, "job submitted");
    }

    (
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job.job_id.clone(),
            status: job.status,
            created_at: job.created_at,
        }),
    )
        .into_response()
}

async fn get_job(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    if Uuid::parse_str(&job_id).is_err() {
        return error_response(StatusCode::BAD_REQUEST, "invalid job_id format");
    }
    match state.store.get(&job_id).await {
        Ok(job) => Json(job).into_response(),
        Err(StoreError::NotFound) => error_response(StatusCode::NOT_FOUND, "job not found"),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "job lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    status: Option<String>,
}

async fn list_jobs(State(state): State<ApiState>, Query(query): Query<ListQuery>) -> Response {
    let limit = query
        .limit
        .filter(|l| *l > 0 && *l <= MAX_LIST_LIMIT)
        .unwrap_or(DEFAULT_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let status = query
        .status
        .as_deref()
        .and_then(|s| JobStatus::from_str(s).ok());

    match state.store.list(limit, offset, status).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "job listing failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

async fn agents_online(State(state): State<ApiState>) -> Response {
    Json(state.registry.online()).into_response()
}

async fn health() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}
