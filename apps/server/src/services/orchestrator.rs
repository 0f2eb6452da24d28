//! Asynchronous job execution with polling, awaiting and cancellation.
//!
//! Jobs are queued in `submitted` state and dispatched onto the tokio runtime right
//! away; a semaphore bounds how many execute at once. Callers never block on a job
//! unless they explicitly await it.

use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::{
    config::WorkersConfig,
    queue::{Job, JobPriority, JobQueue, JobStatus, RetryPolicy},
    workers::Worker,
    Error, Result,
};

pub struct JobOrchestrator {
    job_queue: Arc<dyn JobQueue>,
    workers: HashMap<String, Arc<dyn Worker>>,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
    worker_id: String,
}

impl JobOrchestrator {
    pub fn new(job_queue: Arc<dyn JobQueue>, config: &WorkersConfig) -> Self {
        Self {
            job_queue,
            workers: HashMap::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            worker_id: format!("cinder-{}", Uuid::new_v4()),
        }
    }

    /// Route every job type `worker` supports to it.
    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        for job_type in worker.supported_job_types() {
            tracing::info!(
                worker_name = worker.name(),
                job_type = *job_type,
                "Worker registered"
            );
            self.workers.insert(job_type.to_string(), worker.clone());
        }
    }

    pub fn job_queue(&self) -> &Arc<dyn JobQueue> {
        &self.job_queue
    }

    /// Queue a job and start it in the background. Returns as soon as it is queued.
    pub async fn submit(
        &self,
        job_type: &str,
        parameters: serde_json::Value,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<Uuid> {
        let worker = self.worker_for(job_type)?;
        let job_id = self
            .job_queue
            .enqueue(
                job_type.to_string(),
                parameters,
                JobPriority::Normal,
                retry_policy,
            )
            .await?;
        self.dispatch(job_id, worker);
        Ok(job_id)
    }

    /// Re-dispatch jobs left `submitted` or `running` by a previous process.
    pub async fn resume_interrupted(&self) -> Result<usize> {
        let mut resumed = 0;
        for status in [JobStatus::Submitted, JobStatus::Running] {
            for job in self.job_queue.list_jobs(None, Some(status)).await? {
                let Ok(worker) = self.worker_for(&job.job_type) else {
                    tracing::warn!(job_id = %job.id, job_type = %job.job_type, "No worker for interrupted job");
                    continue;
                };
                tracing::info!(job_id = %job.id, status = %job.status, "Resuming interrupted job");
                self.dispatch(job.id, worker);
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Job> {
        self.job_queue
            .get_job(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Wait until the job reaches a terminal state.
    ///
    /// Fails with `Error::Timeout` once `timeout` has passed; the job keeps running and
    /// can be awaited again.
    pub async fn await_completion(&self, job_id: Uuid, timeout: Duration) -> Result<Job> {
        let started = tokio::time::Instant::now();
        let deadline = started + timeout;
        loop {
            let job = self.get(job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    job_id,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            self.job_queue
                .wait_for_change(self.poll_interval.min(deadline - now))
                .await;
        }
    }

    /// Request cancellation. A running batch finishes; no further batch starts.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let job = self.get(job_id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        self.job_queue.cancel_job(job_id).await
    }

    pub async fn list_executions(&self, job_type: &str) -> Result<Vec<Job>> {
        self.job_queue.list_jobs(Some(job_type), None).await
    }

    fn worker_for(&self, job_type: &str) -> Result<Arc<dyn Worker>> {
        self.workers
            .get(job_type)
            .cloned()
            .ok_or_else(|| Error::JobQueue(format!("No worker registered for job type {}", job_type)))
    }

    fn dispatch(&self, job_id: Uuid, worker: Arc<dyn Worker>) {
        let job_queue = self.job_queue.clone();
        let permits = self.permits.clone();
        let worker_id = self.worker_id.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = run_job(job_queue.as_ref(), worker.as_ref(), job_id, &worker_id).await {
                tracing::error!(job_id = %job_id, error = %e, "Job execution failed");
                if let Err(e) = job_queue.fail_job(job_id, e.to_string(), None).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
                }
            }
        });
    }
}

async fn run_job(
    job_queue: &dyn JobQueue,
    worker: &dyn Worker,
    job_id: Uuid,
    worker_id: &str,
) -> Result<()> {
    if !job_queue.mark_running(job_id, worker_id).await? {
        let job = job_queue
            .get_job(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;
        if !job.status.is_terminal() && job.cancel_requested {
            // Cancelled while an earlier process was running it. Recorded progress is kept.
            job_queue.complete_job(job_id, None).await?;
            tracing::info!(job_id = %job_id, "Interrupted job finalized as cancelled");
        } else {
            tracing::info!(job_id = %job_id, status = %job.status, "Job not claimed");
        }
        return Ok(());
    }
    let job = job_queue
        .get_job(job_id)
        .await?
        .ok_or(Error::JobNotFound(job_id))?;

    tracing::info!(job_id = %job_id, worker = worker.name(), "Job started");
    worker.process_job(job).await
}
