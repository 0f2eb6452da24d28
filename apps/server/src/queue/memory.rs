//! In-process job queue.
//!
//! Jobs live in a mutex-guarded map and are lost on restart. State changes wake
//! anyone blocked in `wait_for_change`, so awaiting a job does not depend on the
//! poll interval alone.

use super::{Job, JobPriority, JobQueue, JobStatus, RetryPolicy};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<HashMap<Uuid, Job>>,
    changed: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Job>>> {
        self.jobs
            .lock()
            .map_err(|_| Error::JobQueue("job table lock poisoned".to_string()))
    }

    fn update_job<F>(&self, job_id: Uuid, f: F) -> Result<()>
    where
        F: FnOnce(&mut Job),
    {
        {
            let mut jobs = self.jobs()?;
            let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
            f(job);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    fn finish(
        &self,
        job_id: Uuid,
        honour_cancel: bool,
        final_results: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = Utc::now();
        self.update_job(job_id, |job| {
            job.status = if honour_cancel && job.cancel_requested {
                JobStatus::Cancelled
            } else {
                JobStatus::Completed
            };
            job.completed_at = Some(now);
            if final_results.is_some() {
                job.progress = final_results;
            }
        })
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        job_type: String,
        parameters: serde_json::Value,
        priority: JobPriority,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<Uuid> {
        let retry_policy_json =
            serde_json::to_value(retry_policy.unwrap_or_default()).map_err(|e| {
                Error::Internal(format!("Failed to serialize retry policy: {}", e))
            })?;

        let job = Job::new(job_type, parameters, priority, retry_policy_json);
        let job_id = job.id;
        tracing::debug!(job_id = %job_id, job_type = %job.job_type, "Enqueued job");
        self.jobs()?.insert(job_id, job);
        self.changed.notify_waiters();
        Ok(job_id)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs()?.get(&job_id).cloned())
    }

    async fn list_jobs(
        &self,
        job_type: Option<&str>,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs()?
            .values()
            .filter(|job| job_type.map_or(true, |t| job.job_type == t))
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn mark_running(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let claimed = {
            let mut jobs = self.jobs()?;
            let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
            if job.status.is_terminal() || job.cancel_requested {
                false
            } else {
                job.status = JobStatus::Running;
                job.started_at.get_or_insert_with(Utc::now);
                job.worker_id = Some(worker_id.to_string());
                true
            }
        };
        self.changed.notify_waiters();
        Ok(claimed)
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        processed_items: i32,
        total_items: Option<i32>,
        progress_data: Option<serde_json::Value>,
    ) -> Result<()> {
        self.update_job(job_id, |job| {
            job.processed_items = processed_items;
            if let Some(total) = total_items {
                job.total_items = Some(total);
            }
            if progress_data.is_some() {
                job.progress = progress_data;
            }
        })
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        final_results: Option<serde_json::Value>,
    ) -> Result<()> {
        self.finish(job_id, true, final_results)
    }

    async fn mark_completed(
        &self,
        job_id: Uuid,
        final_results: Option<serde_json::Value>,
    ) -> Result<()> {
        self.finish(job_id, false, final_results)
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error_message: String,
        final_results: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = Utc::now();
        self.update_job(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error_message = Some(error_message);
            job.last_error_at = Some(now);
            job.completed_at = Some(now);
            if final_results.is_some() {
                job.progress = final_results;
            }
        })
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let cancelled = {
            let mut jobs = self.jobs()?;
            match jobs.get_mut(&job_id) {
                Some(job) if !job.status.is_terminal() => {
                    job.cancel_requested = true;
                    // Nothing has run yet: finish right away.
                    if job.status == JobStatus::Submitted {
                        job.status = JobStatus::Cancelled;
                        job.completed_at = Some(Utc::now());
                    }
                    true
                }
                _ => false,
            }
        };
        self.changed.notify_waiters();
        Ok(cancelled)
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool> {
        Ok(self
            .jobs()?
            .get(&job_id)
            .map(|j| j.cancel_requested)
            .unwrap_or(false))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs()?;
        let deletable = jobs
            .get(&job_id)
            .map(|job| job.status.is_terminal())
            .unwrap_or(false);
        if deletable {
            jobs.remove(&job_id);
        }
        Ok(deletable)
    }

    async fn health_check(&self) -> Result<serde_json::Value> {
        let jobs = self.jobs()?;
        let count = |status: JobStatus| jobs.values().filter(|j| j.status == status).count();
        Ok(serde_json::json!({
            "status": "ok",
            "backend": "memory",
            "stats": {
                "total": jobs.len(),
                "submitted": count(JobStatus::Submitted),
                "running": count(JobStatus::Running),
                "completed": count(JobStatus::Completed),
                "failed": count(JobStatus::Failed),
                "cancelled": count(JobStatus::Cancelled),
            }
        }))
    }

    async fn wait_for_change(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.changed.notified()).await;
    }
}
