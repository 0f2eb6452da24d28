//! Job queue trait definition

use super::models::*;
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Abstract interface for job queue implementations
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a new job in `submitted` state
    async fn enqueue(
        &self,
        job_type: String,
        parameters: serde_json::Value,
        priority: JobPriority,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<Uuid>;

    /// Get job by ID
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// List jobs, newest first
    async fn list_jobs(
        &self,
        job_type: Option<&str>,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>>;

    /// Claim a submitted (or interrupted running) job. Returns false when the job
    /// was cancelled or already finished.
    async fn mark_running(&self, job_id: Uuid, worker_id: &str) -> Result<bool>;

    /// Update job progress
    async fn update_progress(
        &self,
        job_id: Uuid,
        processed_items: i32,
        total_items: Option<i32>,
        progress_data: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Mark job as completed, or cancelled if cancellation was requested meanwhile
    async fn complete_job(
        &self,
        job_id: Uuid,
        final_results: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Mark job as completed even if cancellation was requested after its last step
    async fn mark_completed(
        &self,
        job_id: Uuid,
        final_results: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Mark job as failed, keeping whatever progress was recorded
    async fn fail_job(
        &self,
        job_id: Uuid,
        error_message: String,
        final_results: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Request job cancellation
    async fn cancel_job(&self, job_id: Uuid) -> Result<bool>;

    /// Check if job was cancelled
    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool>;

    /// Delete a single job (must be in a terminal state)
    async fn delete_job(&self, job_id: Uuid) -> Result<bool>;

    /// Health check
    async fn health_check(&self) -> Result<serde_json::Value>;

    /// Wait until some job changes state, or `max_wait` passes.
    async fn wait_for_change(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}
