//! Delete-by-criteria with `_expunge=true`.
//!
//! Gate checks, candidate resolution, conflict detection and batch planning run on the
//! caller's task; the batches run as a `DELETE_EXPUNGE` job.

use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    conflicts::ConflictDetector, orchestrator::JobOrchestrator, outcome::OutcomeReporter, planner,
};
use crate::{
    config::ExpungeConfig,
    db::ResourceStore,
    metrics::ExpungeMetrics,
    models::{
        DeleteExpungeJobParams, DeleteOutcome, DeleteRequest, ExpungeOutcome, JobAcknowledgment,
        ResourceKey, DELETE_EXPUNGE_JOB_TYPE,
    },
    queue::RetryPolicy,
    Error, Result,
};

pub struct DeleteExpungeService {
    store: Arc<dyn ResourceStore>,
    detector: ConflictDetector,
    orchestrator: Arc<JobOrchestrator>,
    reporter: OutcomeReporter,
    config: ExpungeConfig,
    metrics: Arc<ExpungeMetrics>,
    /// Serializes detection plus submission across concurrent requests.
    submit_lock: Mutex<()>,
}

impl DeleteExpungeService {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        detector: ConflictDetector,
        orchestrator: Arc<JobOrchestrator>,
        config: ExpungeConfig,
        metrics: Arc<ExpungeMetrics>,
    ) -> Self {
        let reporter = OutcomeReporter::new(orchestrator.job_queue().clone());
        Self {
            store,
            detector,
            orchestrator,
            reporter,
            config,
            metrics,
            submit_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ExpungeConfig {
        &self.config
    }

    /// Resolve, check and plan `request`, then queue the batches.
    ///
    /// Conflicts and disabled gates fail here, before anything is removed. An empty
    /// match returns an immediate zero outcome without creating a job.
    pub async fn delete_by_criteria(&self, request: DeleteRequest) -> Result<DeleteOutcome> {
        if !request.expunge {
            return Err(Error::NotImplemented(
                "Conditional delete without _expunge=true is not supported".to_string(),
            ));
        }
        self.check_gates()?;

        let resource_type = request.criteria.resource_type.clone();
        let _guard = self.submit_lock.lock().await;

        let candidates = self.resolve_candidates(&request).await?;
        if candidates.is_empty() {
            tracing::info!(resource_type = %resource_type, "Delete-expunge matched nothing");
            return Ok(DeleteOutcome::Immediate(ExpungeOutcome::empty(&resource_type)));
        }
        if candidates.len() > 1 && !self.config.allow_multiple_delete {
            return Err(Error::PreconditionFailed(format!(
                "Delete of {} matched {} resources but multiple deletes are not allowed",
                resource_type,
                candidates.len()
            )));
        }

        if let Err(e) = self.detector.ensure_conflict_free(&candidates).await {
            if matches!(e, Error::ReferentialConflict { .. }) {
                self.metrics.conflicts_rejected.inc();
            }
            return Err(e);
        }

        let batch_size = self.config.expunge_batch_size.max(1);
        let batch_count = planner::plan(candidates.iter().cloned(), batch_size).len();
        let params = DeleteExpungeJobParams {
            resource_type: resource_type.clone(),
            candidates: candidates.into_iter().collect(),
            batch_size,
            max_parallel_batches: self.config.max_parallel_batches.max(1),
        };
        let candidate_count = params.candidates.len();

        let job_id = self
            .orchestrator
            .submit(
                DELETE_EXPUNGE_JOB_TYPE,
                params.to_value()?,
                Some(RetryPolicy::new(
                    self.config.batch_max_retries,
                    self.config.batch_retry_backoff_ms,
                )),
            )
            .await?;

        tracing::info!(
            job_id = %job_id,
            resource_type = %resource_type,
            resources = candidate_count,
            batches = batch_count,
            "Delete-expunge job submitted"
        );

        Ok(DeleteOutcome::Submitted(JobAcknowledgment::new(
            job_id,
            candidate_count,
            batch_count,
        )))
    }

    /// Wait for a job and report its outcome.
    pub async fn await_outcome(&self, job_id: Uuid, timeout: Duration) -> Result<ExpungeOutcome> {
        let job = self.orchestrator.await_completion(job_id, timeout).await?;
        OutcomeReporter::from_job(&job)
    }

    /// Outcome of a finished job, `JobNotFinished` otherwise.
    pub async fn outcome(&self, job_id: Uuid) -> Result<ExpungeOutcome> {
        self.reporter.outcome(job_id).await
    }

    fn check_gates(&self) -> Result<()> {
        if !self.config.expunge_enabled {
            return Err(Error::ConfigurationDisabled(
                "Expunge is not enabled on this server".to_string(),
            ));
        }
        if !self.config.delete_expunge_enabled {
            return Err(Error::ConfigurationDisabled(
                "Delete expunge is not enabled on this server".to_string(),
            ));
        }
        Ok(())
    }

    /// Page through matching resources in windows of `internal_synchronous_search_size`.
    async fn resolve_candidates(&self, request: &DeleteRequest) -> Result<BTreeSet<ResourceKey>> {
        let page_size = self.config.internal_synchronous_search_size.max(1);
        let mut candidates = BTreeSet::new();
        let mut offset = 0;
        loop {
            let page = self
                .store
                .find_candidates(&request.criteria, &request.partition, offset, page_size)
                .await?;
            let fetched = page.len();
            candidates.extend(page);
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }
        tracing::debug!(
            resource_type = %request.criteria.resource_type,
            matched = candidates.len(),
            "Resolved delete candidates"
        );
        Ok(candidates)
    }
}
