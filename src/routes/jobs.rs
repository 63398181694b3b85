use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::app_state::AppState;
use crate::models::job::{Job, JobId, JobPayload, JobResult, JobStatus, JobType};
use crate::routes::error::ApiError;
use crate::routes::ApiResponse;
use crate::services::queue::QueueError;

/// Upper bound on how long a result request may block.
const MAX_WAIT_MS: u64 = 30_000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedJob {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    /// True when `wait_ms` elapsed before the job finished.
    pub timed_out: bool,
}

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    pub wait_ms: Option<u64>,
}

/// POST /api/v1/jobs: enqueue a typed job; returns 202 with its id.
pub async fn submit_job(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<SubmittedJob>>), ApiError> {
    let Json(body) = body?;
    let payload: JobPayload = serde_json::from_value(body)
        .map_err(|e| ApiError::InvalidParameters(format!("Invalid job request: {}", e)))?;
    if payload.document_id().trim().is_empty() {
        return Err(ApiError::InvalidParameters(
            "documentId is required".to_string(),
        ));
    }

    let job_type = payload.job_type();
    let job_id = state.queue.enqueue(payload).await?;

    Ok((
        StatusCode::ACCEPTED,
        ApiResponse::ok(SubmittedJob {
            job_id,
            job_type,
            status: JobStatus::Waiting,
        }),
    ))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Job>>, ApiError> {
    let job_id = id.parse::<JobId>().map_err(|_| ApiError::JobNotFound(id.clone()))?;
    let job = state
        .queue
        .job(job_id)
        .await?
        .ok_or(ApiError::JobNotFound(id))?;
    Ok(ApiResponse::ok(job))
}

/// GET /api/v1/jobs/{id}/status: `unknown` for ids never issued.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<JobStatusResponse>>, ApiError> {
    let status = match id.parse::<JobId>() {
        Ok(job_id) => state.queue.status(job_id).await?,
        Err(_) => JobStatus::Unknown,
    };
    Ok(ApiResponse::ok(JobStatusResponse { job_id: id, status }))
}

/// GET /api/v1/jobs/{id}/result?wait_ms=
///
/// 200 once the job is terminal, 202 while it is still waiting or active.
/// With `wait_ms` the request polls up to that long first; running out of
/// time is reported through `timedOut`, and the job keeps running.
pub async fn get_job_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<ResultQuery>, QueryRejection>,
) -> Result<(StatusCode, Json<ApiResponse<JobResultResponse>>), ApiError> {
    let Query(query) = query?;
    let job_id = id.parse::<JobId>().map_err(|_| ApiError::JobNotFound(id.clone()))?;

    let mut timed_out = false;
    if let Some(wait_ms) = query.wait_ms.filter(|ms| *ms > 0) {
        let wait = Duration::from_millis(wait_ms.min(MAX_WAIT_MS));
        match state.queue.wait_for_result(job_id, wait).await {
            Ok(_) => {}
            Err(QueueError::Timeout { .. }) => timed_out = true,
            Err(QueueError::JobNotFound(_)) => return Err(ApiError::JobNotFound(id)),
            Err(e) => return Err(e.into()),
        }
    }

    let status = state.queue.status(job_id).await?;
    if status == JobStatus::Unknown {
        return Err(ApiError::JobNotFound(id));
    }
    let result = state.queue.result(job_id).await?;
    let code = if result.is_some() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };

    Ok((
        code,
        ApiResponse::ok(JobResultResponse {
            job_id,
            status,
            result,
            timed_out,
        }),
    ))
}
