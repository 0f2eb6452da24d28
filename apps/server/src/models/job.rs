//! Payloads stored on delete-expunge job records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{BatchCounts, ResourceKey};
use crate::{Error, Result};

/// Job type under which delete-expunge executions are queued and listed.
pub const DELETE_EXPUNGE_JOB_TYPE: &str = "DELETE_EXPUNGE";

/// Parameters of a delete-expunge job.
///
/// The full, conflict-cleared candidate set is stored so the batch plan can be rebuilt
/// identically when the job resumes, and so each batch can re-check referrers against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteExpungeJobParams {
    pub resource_type: String,
    pub candidates: Vec<ResourceKey>,
    pub batch_size: usize,
    pub max_parallel_batches: usize,
}

impl DeleteExpungeJobParams {
    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| Error::Internal(format!("Failed to serialize job parameters: {}", e)))
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Internal(format!("Failed to parse job parameters: {}", e)))
    }
}

/// Per-batch results recorded on the job as batches commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpungeProgress {
    pub batch_count: usize,
    /// Committed batches by plan index.
    pub completed_batches: BTreeMap<usize, BatchCounts>,
}

impl ExpungeProgress {
    pub fn new(batch_count: usize) -> Self {
        Self {
            batch_count,
            completed_batches: BTreeMap::new(),
        }
    }

    /// Progress recorded on a job, if any could be read.
    pub fn from_job_progress(progress: Option<&serde_json::Value>) -> Option<Self> {
        progress.and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn record(&mut self, batch_index: usize, counts: BatchCounts) {
        self.completed_batches.insert(batch_index, counts);
    }

    pub fn is_done(&self, batch_index: usize) -> bool {
        self.completed_batches.contains_key(&batch_index)
    }

    pub fn totals(&self) -> BatchCounts {
        let mut total = BatchCounts::default();
        for counts in self.completed_batches.values() {
            total += *counts;
        }
        total
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| Error::Internal(format!("Failed to serialize job progress: {}", e)))
    }
}
