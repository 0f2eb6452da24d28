//! Job queue: records of asynchronous delete-expunge executions

mod memory;
mod models;
mod postgres;
mod traits;

pub use memory::InMemoryJobQueue;
pub use models::{Job, JobPriority, JobStatus, RetryPolicy};
pub use postgres::PostgresJobQueue;
pub use traits::JobQueue;
