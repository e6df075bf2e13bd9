// HTTP route handlers for the Arbiter API

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use arbiter_common::store::StoreError;
use arbiter_common::types::{JobStatus, Submission};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub job_id: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// POST /submit - Validate a submission and queue it for judging
pub async fn submit(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Submission>, JsonRejection>,
) -> Response {
    let submission = match payload {
        Ok(Json(submission)) => submission,
        Err(rejection) => {
            metrics::SUBMISSIONS_REJECTED_TOTAL.inc();
            warn!(error = %rejection, "Rejected unreadable submission body");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    if let Err(e) = submission.validate() {
        metrics::SUBMISSIONS_REJECTED_TOTAL.inc();
        info!(problem_id = %submission.problem_id, reason = %e, "Rejected submission");
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    match state.store.enqueue(&submission).await {
        Ok(job_id) => {
            metrics::SUBMISSIONS_TOTAL.inc();
            info!(
                job_id = %job_id,
                problem_id = %submission.problem_id,
                source_size = submission.code.len(),
                "Job queued"
            );
            (
                StatusCode::CREATED,
                Json(SubmitResponse {
                    job_id: job_id.to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(problem_id = %submission.problem_id, error = %e, "Failed to queue job");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue submission")
        }
    }
}

/// GET /status?jobId=<id> - Poll a job
pub async fn status(State(state): State<Arc<AppState>>, Query(query): Query<StatusQuery>) -> Response {
    match query.job_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        Some(job_id) => lookup(&state, job_id).await,
        None => error_response(StatusCode::BAD_REQUEST, "Missing jobId"),
    }
}

/// GET /jobs/:id - Poll a job by path
pub async fn job_status(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    lookup(&state, &job_id).await
}

async fn lookup(state: &AppState, job_id: &str) -> Response {
    let Ok(id) = Uuid::parse_str(job_id) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid job ID format");
    };

    match state.store.status(id).await {
        Ok(Some(status)) => {
            metrics::STATUS_POLLS_TOTAL
                .with_label_values(&[status.state().as_str()])
                .inc();
            log_status(id, &status);
            (StatusCode::OK, Json(status)).into_response()
        }
        Ok(None) => {
            metrics::STATUS_POLLS_TOTAL.with_label_values(&["unknown"]).inc();
            error_response(StatusCode::NOT_FOUND, "Job not found")
        }
        Err(e @ StoreError::Corrupt { .. }) => {
            error!(job_id = %id, error = %e, "Job record is unreadable");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Job record is unreadable")
        }
        Err(e) => {
            error!(job_id = %id, error = %e, "Failed to fetch job status");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to query job status")
        }
    }
}

fn log_status(id: Uuid, status: &JobStatus) {
    match status {
        JobStatus::Completed { verdict } => {
            info!(job_id = %id, verdict = %verdict.verdict, "Job result retrieved")
        }
        other => info!(job_id = %id, state = %other.state(), "Job status retrieved"),
    }
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus text exposition
pub async fn export_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
