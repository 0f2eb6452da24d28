//! Domain models

mod criteria;
mod job;
mod outcome;
mod resource;

pub use criteria::{DeleteRequest, SearchCriteria, PARAM_DELETE_EXPUNGE};
pub use job::{DeleteExpungeJobParams, ExpungeProgress, DELETE_EXPUNGE_JOB_TYPE};
pub use outcome::{
    Batch, BatchCounts, DeleteOutcome, ExpungeOutcome, JobAcknowledgment,
    DELETE_JOB_SUBMITTED_PREFIX,
};
pub use resource::{
    Conflict, PartitionId, ReferenceLink, RequestPartition, ResourceKey, StoredResource,
};
