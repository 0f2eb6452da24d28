//! Results handed back to delete-expunge callers

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::ops::AddAssign;
use uuid::Uuid;

use super::ResourceKey;
use crate::queue::JobStatus;

pub const DELETE_JOB_SUBMITTED_PREFIX: &str = "Delete job submitted";

/// Ordered, size-bounded slice of the candidate set processed as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub index: usize,
    pub keys: Vec<ResourceKey>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Rows removed by one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCounts {
    /// Logical resources removed.
    pub resources_expunged: u64,
    /// Physical rows removed: version, counter, link and index rows.
    pub entities_expunged: u64,
}

impl AddAssign for BatchCounts {
    fn add_assign(&mut self, other: Self) {
        self.resources_expunged += other.resources_expunged;
        self.entities_expunged += other.entities_expunged;
    }
}

/// Final figures of a delete-expunge job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpungeOutcome {
    pub job_id: Option<Uuid>,
    pub status: JobStatus,
    pub expunged_resources_count: u64,
    pub expunged_entities_count: u64,
    pub diagnostics: String,
}

impl ExpungeOutcome {
    /// Outcome of a request that matched nothing: no job, nothing removed.
    pub fn empty(resource_type: &str) -> Self {
        Self {
            job_id: None,
            status: JobStatus::Completed,
            expunged_resources_count: 0,
            expunged_entities_count: 0,
            diagnostics: format!(
                "No {} resources matched the delete criteria; nothing to expunge",
                resource_type
            ),
        }
    }

    pub fn to_operation_outcome(&self) -> serde_json::Value {
        let severity = match self.status {
            JobStatus::Failed => "error",
            JobStatus::Cancelled => "warning",
            _ => "information",
        };
        json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": severity,
                "code": "informational",
                "diagnostics": self.diagnostics,
            }],
            "extension": [
                { "url": "expungedResourcesCount", "valueInteger": self.expunged_resources_count },
                { "url": "expungedEntitiesCount", "valueInteger": self.expunged_entities_count },
            ]
        })
    }
}

/// Returned as soon as a delete-expunge job has been queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAcknowledgment {
    pub job_id: Uuid,
    pub candidate_count: usize,
    pub batch_count: usize,
    pub message: String,
}

impl JobAcknowledgment {
    pub fn new(job_id: Uuid, candidate_count: usize, batch_count: usize) -> Self {
        Self {
            job_id,
            candidate_count,
            batch_count,
            message: format!(
                "{} with job id {}: {} resource(s) in {} batch(es)",
                DELETE_JOB_SUBMITTED_PREFIX, job_id, candidate_count, batch_count
            ),
        }
    }

    pub fn to_operation_outcome(&self) -> serde_json::Value {
        json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": "information",
                "code": "informational",
                "diagnostics": self.message,
            }]
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Submitted(JobAcknowledgment),
    Immediate(ExpungeOutcome),
}

impl DeleteOutcome {
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            DeleteOutcome::Submitted(ack) => Some(ack.job_id),
            DeleteOutcome::Immediate(outcome) => outcome.job_id,
        }
    }

    pub fn diagnostics(&self) -> &str {
        match self {
            DeleteOutcome::Submitted(ack) => &ack.message,
            DeleteOutcome::Immediate(outcome) => &outcome.diagnostics,
        }
    }
}
