//! Delete-expunge worker

use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::{collections::HashSet, sync::Arc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::Worker;
use crate::{
    metrics::ExpungeMetrics,
    models::{
        Batch, DeleteExpungeJobParams, ExpungeProgress, ResourceKey, DELETE_EXPUNGE_JOB_TYPE,
    },
    queue::{Job, JobQueue, JobStatus, RetryPolicy},
    services::{executor::DeleteExpungeExecutor, planner},
    Error, Result,
};

enum BatchRun {
    Done,
    /// Not started because cancellation was requested.
    Skipped,
}

pub struct DeleteExpungeWorker {
    job_queue: Arc<dyn JobQueue>,
    executor: Arc<DeleteExpungeExecutor>,
    metrics: Arc<ExpungeMetrics>,
}

impl DeleteExpungeWorker {
    pub fn new(
        job_queue: Arc<dyn JobQueue>,
        executor: Arc<DeleteExpungeExecutor>,
        metrics: Arc<ExpungeMetrics>,
    ) -> Self {
        Self {
            job_queue,
            executor,
            metrics,
        }
    }

    async fn run_batch(
        &self,
        job_id: Uuid,
        batch: Batch,
        allowed_referrers: &HashSet<ResourceKey>,
        policy: &RetryPolicy,
        progress: &Mutex<ExpungeProgress>,
    ) -> Result<BatchRun> {
        if self.job_queue.is_cancelled(job_id).await? {
            tracing::info!(job_id = %job_id, batch = batch.index, "Cancellation requested; batch not started");
            return Ok(BatchRun::Skipped);
        }

        let counts = self
            .executor
            .execute_with_retry(&batch, allowed_referrers, policy)
            .await?;

        // Held across the write so concurrent batches cannot store an older snapshot last.
        let mut progress = progress.lock().await;
        progress.record(batch.index, counts);
        self.job_queue
            .update_progress(
                job_id,
                progress.completed_batches.len() as i32,
                Some(progress.batch_count as i32),
                Some(progress.to_value()?),
            )
            .await?;

        Ok(BatchRun::Done)
    }

    async fn run_sequential(
        &self,
        job_id: Uuid,
        pending: Vec<Batch>,
        allowed_referrers: &HashSet<ResourceKey>,
        policy: &RetryPolicy,
        progress: &Mutex<ExpungeProgress>,
    ) -> Option<Error> {
        for batch in pending {
            match self
                .run_batch(job_id, batch, allowed_referrers, policy, progress)
                .await
            {
                Ok(BatchRun::Done) => {}
                Ok(BatchRun::Skipped) => return None,
                Err(e) => return Some(e),
            }
        }
        None
    }

    /// Every pending batch is attempted, even after another one failed.
    async fn run_parallel(
        &self,
        job_id: Uuid,
        pending: Vec<Batch>,
        parallelism: usize,
        allowed_referrers: &HashSet<ResourceKey>,
        policy: &RetryPolicy,
        progress: &Mutex<ExpungeProgress>,
    ) -> Option<Error> {
        let results: Vec<Result<BatchRun>> = stream::iter(pending)
            .map(|batch| self.run_batch(job_id, batch, allowed_referrers, policy, progress))
            .buffer_unordered(parallelism)
            .collect()
            .await;

        results.into_iter().find_map(|result| result.err())
    }
}

#[async_trait]
impl Worker for DeleteExpungeWorker {
    fn name(&self) -> &str {
        "DeleteExpungeWorker"
    }

    fn supported_job_types(&self) -> &[&str] {
        &[DELETE_EXPUNGE_JOB_TYPE]
    }

    async fn process_job(&self, job: Job) -> Result<()> {
        let job_id = job.id;
        let params = DeleteExpungeJobParams::from_value(&job.parameters)?;
        let policy = job.get_retry_policy();

        let batches = planner::plan(params.candidates.iter().cloned(), params.batch_size);
        let allowed_referrers: HashSet<ResourceKey> = params.candidates.into_iter().collect();

        let mut progress = ExpungeProgress::from_job_progress(job.progress.as_ref())
            .unwrap_or_else(|| ExpungeProgress::new(batches.len()));
        progress.batch_count = batches.len();
        let pending: Vec<Batch> = batches
            .into_iter()
            .filter(|batch| !progress.is_done(batch.index))
            .collect();

        tracing::info!(
            job_id = %job_id,
            resource_type = %params.resource_type,
            resources = allowed_referrers.len(),
            batches = progress.batch_count,
            already_done = progress.completed_batches.len(),
            parallelism = params.max_parallel_batches.max(1),
            "{} processing delete-expunge job",
            self.name()
        );

        let progress = Mutex::new(progress);
        let failure = if params.max_parallel_batches <= 1 {
            self.run_sequential(job_id, pending, &allowed_referrers, &policy, &progress)
                .await
        } else {
            self.run_parallel(
                job_id,
                pending,
                params.max_parallel_batches,
                &allowed_referrers,
                &policy,
                &progress,
            )
            .await
        };

        let progress = progress.into_inner();
        let final_results = Some(progress.to_value()?);
        let totals = progress.totals();

        let status = match failure {
            Some(e) => {
                tracing::error!(
                    job_id = %job_id,
                    completed_batches = progress.completed_batches.len(),
                    error = %e,
                    "Delete-expunge job failed"
                );
                self.job_queue
                    .fail_job(job_id, e.to_string(), final_results)
                    .await?;
                JobStatus::Failed
            }
            None if progress.completed_batches.len() >= progress.batch_count => {
                // Every batch committed; a cancel arriving now has nothing left to stop.
                self.job_queue.mark_completed(job_id, final_results).await?;
                JobStatus::Completed
            }
            None => {
                self.job_queue.complete_job(job_id, final_results).await?;
                self.job_queue
                    .get_job(job_id)
                    .await?
                    .map(|j| j.status)
                    .unwrap_or(JobStatus::Completed)
            }
        };

        self.metrics
            .jobs_finished
            .with_label_values(&[status.as_str()])
            .inc();
        tracing::info!(
            job_id = %job_id,
            status = %status,
            resources = totals.resources_expunged,
            entities = totals.entities_expunged,
            "Delete-expunge job finished"
        );

        Ok(())
    }
}
