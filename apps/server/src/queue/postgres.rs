//! PostgreSQL-backed job queue.
//!
//! Job rows survive restarts, which lets interrupted delete-expunge jobs resume
//! from their recorded batch progress.

use super::{models::*, traits::JobQueue};
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, job_type, status, priority, parameters, progress, retry_policy, \
     processed_items, total_items, error_message, last_error_at, cancel_requested, \
     created_at, started_at, completed_at, worker_id";

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled')";

pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(
        &self,
        job_type: String,
        parameters: serde_json::Value,
        priority: JobPriority,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<Uuid> {
        let retry_policy_json = serde_json::to_value(retry_policy.unwrap_or_default())
            .map_err(|e| Error::Internal(format!("Failed to serialize retry policy: {}", e)))?;
        let job = Job::new(job_type, parameters, priority, retry_policy_json);

        sqlx::query(
            "INSERT INTO jobs (id, job_type, status, priority, parameters, retry_policy, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(job.status)
        .bind(job.priority)
        .bind(&job.parameters)
        .bind(&job.retry_policy)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "Enqueued job");
        Ok(job.id)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn list_jobs(
        &self,
        job_type: Option<&str>,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>> {
        let mut qb = sqlx::QueryBuilder::<sqlx::Postgres>::new(format!(
            "SELECT {} FROM jobs WHERE TRUE",
            JOB_COLUMNS
        ));
        if let Some(job_type) = job_type {
            qb.push(" AND job_type = ").push_bind(job_type);
        }
        if let Some(status) = status {
            qb.push(" AND status = ").push_bind(status);
        }
        qb.push(" ORDER BY created_at DESC");

        Ok(qb.build_query_as::<Job>().fetch_all(&self.pool).await?)
    }

    async fn mark_running(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        // Running jobs are claimed again when a new process resumes them.
        let claimed = sqlx::query(
            "UPDATE jobs \
             SET status = 'running', started_at = COALESCE(started_at, NOW()), worker_id = $2 \
             WHERE id = $1 AND status IN ('submitted', 'running') AND NOT cancel_requested",
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;
        Ok(claimed)
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        processed_items: i32,
        total_items: Option<i32>,
        progress_data: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs \
             SET processed_items = $2, \
                 total_items = COALESCE($3, total_items), \
                 progress = COALESCE($4, progress) \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(processed_items)
        .bind(total_items)
        .bind(progress_data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        final_results: Option<serde_json::Value>,
    ) -> Result<()> {
        let status: JobStatus = sqlx::query_scalar(
            "UPDATE jobs \
             SET status = CASE WHEN cancel_requested THEN 'cancelled' ELSE 'completed' END, \
                 completed_at = NOW(), \
                 progress = COALESCE($2, progress) \
             WHERE id = $1 \
             RETURNING status",
        )
        .bind(job_id)
        .bind(final_results)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::JobNotFound(job_id))?;

        tracing::info!(job_id = %job_id, status = %status, "Job finished");
        Ok(())
    }

    async fn mark_completed(
        &self,
        job_id: Uuid,
        final_results: Option<serde_json::Value>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE jobs \
             SET status = 'completed', completed_at = NOW(), progress = COALESCE($2, progress) \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(final_results)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(Error::JobNotFound(job_id));
        }

        tracing::info!(job_id = %job_id, status = "completed", "Job finished");
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error_message: String,
        final_results: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE jobs \
             SET status = 'failed', completed_at = NOW(), last_error_at = NOW(), \
                 error_message = $2, progress = COALESCE($3, progress) \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(&error_message)
        .bind(final_results)
        .execute(&self.pool)
        .await?;

        tracing::warn!(job_id = %job_id, error = %error_message, "Job failed");
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        // A job that has not started is finished on the spot; a running one stops
        // before its next batch.
        let status: Option<JobStatus> = sqlx::query_scalar(&format!(
            "UPDATE jobs \
             SET cancel_requested = TRUE, \
                 status = CASE WHEN status = 'submitted' THEN 'cancelled' ELSE status END, \
                 completed_at = CASE WHEN status = 'submitted' THEN NOW() ELSE completed_at END \
             WHERE id = $1 AND status NOT IN {} \
             RETURNING status",
            TERMINAL_STATUSES
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match status {
            Some(status) => {
                tracing::info!(job_id = %job_id, status = %status, "Cancellation requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool> {
        let requested: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(requested.unwrap_or(false))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<bool> {
        let deleted = sqlx::query(&format!(
            "DELETE FROM jobs WHERE id = $1 AND status IN {}",
            TERMINAL_STATUSES
        ))
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;
        Ok(deleted)
    }

    async fn health_check(&self) -> Result<serde_json::Value> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS jobs FROM jobs \
             WHERE created_at > NOW() - INTERVAL '24 hours' \
             GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = serde_json::Map::new();
        let mut total = 0i64;
        for status in [
            JobStatus::Submitted,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            stats.insert(status.as_str().to_string(), 0.into());
        }
        for row in rows {
            let status: String = row.try_get("status")?;
            let jobs: i64 = row.try_get("jobs")?;
            total += jobs;
            stats.insert(status, jobs.into());
        }
        stats.insert("total".to_string(), total.into());

        Ok(serde_json::json!({
            "status": "ok",
            "backend": "postgres",
            "stats_24h": stats,
        }))
    }
}
