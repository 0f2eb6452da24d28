//! Admin endpoints over delete-expunge job records

use crate::{
    queue::{Job, JobStatus},
    state::AppState,
    Result,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub job_type: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn job_json(job: &Job) -> serde_json::Value {
    json!({
        "id": job.id,
        "jobType": job.job_type,
        "status": job.status,
        "priority": job.priority,
        "parameters": job.parameters,
        "progress": job.progress,
        "processedItems": job.processed_items,
        "totalItems": job.total_items,
        "errorMessage": job.error_message,
        "lastErrorAt": job.last_error_at,
        "cancelRequested": job.cancel_requested,
        "createdAt": job.created_at,
        "startedAt": job.started_at,
        "completedAt": job.completed_at,
        "workerId": job.worker_id,
        "retryPolicy": job.retry_policy,
    })
}

/// List background jobs with optional filtering, newest first
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Response> {
    let limit = q.limit.unwrap_or(50).clamp(1, 1000);
    let offset = q.offset.unwrap_or(0);

    let status = match q.status.as_deref() {
        Some(raw) => Some(JobStatus::parse(raw).ok_or_else(|| {
            crate::Error::Validation(format!("Unknown job status: {}", raw))
        })?),
        None => None,
    };

    let jobs = state
        .job_queue
        .list_jobs(q.job_type.as_deref(), status)
        .await?;
    let total = jobs.len();

    let jobs_json: Vec<serde_json::Value> =
        jobs.iter().skip(offset).take(limit).map(job_json).collect();

    Ok((
        StatusCode::OK,
        Json(json!({
            "jobs": jobs_json,
            "total": total,
            "limit": limit,
            "offset": offset
        })),
    )
        .into_response())
}

/// Get a single job by ID
pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Result<Response> {
    let job = state.orchestrator.get(job_id).await?;
    Ok((StatusCode::OK, Json(job_json(&job))).into_response())
}

/// Request cancellation of a submitted or running job
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response> {
    let cancelled = state.orchestrator.cancel(job_id).await?;

    if cancelled {
        Ok((
            StatusCode::OK,
            Json(json!({
                "cancelled": true,
                "jobId": job_id
            })),
        )
            .into_response())
    } else {
        Err(crate::Error::Validation(
            "Job already finished".to_string(),
        ))
    }
}

/// Removes a finished job record. Submitted and running jobs are kept.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response> {
    let deleted = state.job_queue.delete_job(job_id).await?;

    if deleted {
        Ok((
            StatusCode::OK,
            Json(json!({
                "deleted": true,
                "jobId": job_id
            })),
        )
            .into_response())
    } else {
        Err(crate::Error::Validation(
            "Job is unknown or has not finished".to_string(),
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeQuery {
    /// Block up to this many milliseconds for the job to finish.
    pub wait_ms: Option<u64>,
}

/// Final counts of a delete-expunge job. 409 while the job is still running.
pub async fn get_job_outcome(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(q): Query<OutcomeQuery>,
) -> Result<Response> {
    let outcome = match q.wait_ms {
        Some(wait_ms) => {
            let wait_ms = wait_ms.min(state.config.workers.default_await_timeout_ms);
            state
                .delete_expunge
                .await_outcome(job_id, Duration::from_millis(wait_ms))
                .await?
        }
        None => state.delete_expunge.outcome(job_id).await?,
    };

    Ok((StatusCode::OK, Json(outcome.to_operation_outcome())).into_response())
}

/// Get queue health and statistics
pub async fn get_queue_health(State(state): State<AppState>) -> Result<Response> {
    let health = state.job_queue.health_check().await?;
    Ok((StatusCode::OK, Json(health)).into_response())
}
