//! Final counts of delete-expunge jobs

use std::sync::Arc;
use uuid::Uuid;

use crate::{
    models::{ExpungeOutcome, ExpungeProgress},
    queue::{Job, JobQueue, JobStatus},
    Error, Result,
};

pub struct OutcomeReporter {
    queue: Arc<dyn JobQueue>,
}

impl OutcomeReporter {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Outcome of a finished job. Fails with `JobNotFinished` while the job is still
    /// submitted or running.
    pub async fn outcome(&self, job_id: Uuid) -> Result<ExpungeOutcome> {
        let job = self
            .queue
            .get_job(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;
        Self::from_job(&job)
    }

    pub fn from_job(job: &Job) -> Result<ExpungeOutcome> {
        if !job.status.is_terminal() {
            return Err(Error::JobNotFinished {
                job_id: job.id,
                status: job.status.to_string(),
            });
        }

        let progress =
            ExpungeProgress::from_job_progress(job.progress.as_ref()).unwrap_or_default();
        let totals = progress.totals();
        let done = progress.completed_batches.len();

        let diagnostics = match job.status {
            JobStatus::Completed => format!(
                "Successfully expunged {} resource(s) ({} storage entities) in {} batch(es)",
                totals.resources_expunged, totals.entities_expunged, done
            ),
            JobStatus::Cancelled => format!(
                "Delete-expunge cancelled after {} of {} batch(es); {} resource(s) expunged",
                done, progress.batch_count, totals.resources_expunged
            ),
            _ => format!(
                "Delete-expunge failed after {} of {} batch(es); {} resource(s) expunged: {}",
                done,
                progress.batch_count,
                totals.resources_expunged,
                job.error_message.as_deref().unwrap_or("unknown error")
            ),
        };

        Ok(ExpungeOutcome {
            job_id: Some(job.id),
            status: job.status,
            expunged_resources_count: totals.resources_expunged,
            expunged_entities_count: totals.entities_expunged,
            diagnostics,
        })
    }
}
