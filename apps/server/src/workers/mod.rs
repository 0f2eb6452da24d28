//! Background workers that execute queued jobs

mod delete_expunge;

pub use delete_expunge::DeleteExpungeWorker;

use crate::{queue::Job, Result};
use async_trait::async_trait;

/// Executes jobs of the types it supports.
///
/// A worker owns the terminal transition of a job it processes: it calls
/// `complete_job` or `fail_job` itself. Returning `Err` means the job could not be
/// processed at all and the runner marks it failed.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    fn supported_job_types(&self) -> &[&str];

    async fn process_job(&self, job: Job) -> Result<()>;
}
