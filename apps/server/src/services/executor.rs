//! Physical removal of one batch at a time

use std::collections::HashSet;
use std::sync::Arc;

use crate::{
    db::ResourceStore,
    metrics::ExpungeMetrics,
    models::{Batch, BatchCounts, ResourceKey},
    queue::RetryPolicy,
    Error, Result,
};

pub struct DeleteExpungeExecutor {
    store: Arc<dyn ResourceStore>,
    metrics: Arc<ExpungeMetrics>,
}

impl DeleteExpungeExecutor {
    pub fn new(store: Arc<dyn ResourceStore>, metrics: Arc<ExpungeMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Remove every row of every resource in `batch` as one atomic unit.
    ///
    /// `allowed_referrers` is the job's whole candidate set; a link from anywhere else
    /// found at commit time fails the batch with `Error::ReferentialConflict`. Storage
    /// errors come back as `Error::BatchExecution`.
    pub async fn execute_batch(
        &self,
        batch: &Batch,
        allowed_referrers: &HashSet<ResourceKey>,
    ) -> Result<BatchCounts> {
        match self.store.expunge_batch(&batch.keys, allowed_referrers).await {
            Ok(counts) => {
                self.metrics.batches_executed.inc();
                self.metrics
                    .resources_expunged
                    .inc_by(counts.resources_expunged);
                self.metrics
                    .entities_expunged
                    .inc_by(counts.entities_expunged);
                tracing::debug!(
                    batch = batch.index,
                    size = batch.len(),
                    resources = counts.resources_expunged,
                    entities = counts.entities_expunged,
                    "Batch expunged"
                );
                Ok(counts)
            }
            Err(e) => {
                self.metrics.batch_failures.inc();
                Err(match e {
                    conflict @ Error::ReferentialConflict { .. } => conflict,
                    other => Error::BatchExecution {
                        batch: batch.index,
                        message: other.to_string(),
                    },
                })
            }
        }
    }

    /// `execute_batch`, attempted again on retryable errors as `policy` allows.
    pub async fn execute_with_retry(
        &self,
        batch: &Batch,
        allowed_referrers: &HashSet<ResourceKey>,
        policy: &RetryPolicy,
    ) -> Result<BatchCounts> {
        let mut attempt = 0;
        loop {
            match self.execute_batch(batch, allowed_referrers).await {
                Ok(counts) => return Ok(counts),
                Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                    let delay = policy.calculate_delay(attempt);
                    tracing::warn!(
                        batch = batch.index,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::InMemoryResourceStore, models::PartitionId, services::planner};
    use prometheus::Registry;
    use serde_json::json;

    async fn setup() -> (Arc<InMemoryResourceStore>, DeleteExpungeExecutor, Arc<ExpungeMetrics>) {
        let store = Arc::new(InMemoryResourceStore::new());
        for id in ["a", "b", "c"] {
            store
                .create(json!({"resourceType": "Patient", "id": id}), PartitionId::default())
                .await
                .unwrap();
        }
        let metrics = Arc::new(ExpungeMetrics::new(&Registry::new(), "test").unwrap());
        let executor = DeleteExpungeExecutor::new(store.clone(), metrics.clone());
        (store, executor, metrics)
    }

    fn patients(ids: &[&str]) -> Vec<ResourceKey> {
        ids.iter().map(|id| ResourceKey::new("Patient", *id)).collect()
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, 1)
    }

    #[tokio::test]
    async fn retries_storage_failures() {
        let (store, executor, metrics) = setup().await;
        let keys = patients(&["a", "b", "c"]);
        let allowed: HashSet<ResourceKey> = keys.iter().cloned().collect();
        let batch = planner::plan(keys, 10).remove(0);

        store.inject_failure(ResourceKey::new("Patient", "b"), 2).await;
        let counts = executor
            .execute_with_retry(&batch, &allowed, &fast_policy(2))
            .await
            .unwrap();

        assert_eq!(counts.resources_expunged, 3);
        assert_eq!(counts.entities_expunged, 9);
        assert_eq!(metrics.batch_failures.get(), 2);
        assert_eq!(metrics.batches_executed.get(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (store, executor, _metrics) = setup().await;
        let keys = patients(&["a"]);
        let allowed: HashSet<ResourceKey> = keys.iter().cloned().collect();
        let batch = planner::plan(keys, 10).remove(0);

        store.inject_failure(ResourceKey::new("Patient", "a"), 5).await;
        let err = executor
            .execute_with_retry(&batch, &allowed, &fast_policy(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BatchExecution { batch: 0, .. }));
        assert_eq!(store.count("Patient").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn conflicts_are_not_retried() {
        let (store, executor, metrics) = setup().await;
        store
            .create(
                json!({"resourceType": "Observation", "id": "o1",
                       "subject": {"reference": "Patient/a"}}),
                PartitionId::default(),
            )
            .await
            .unwrap();
        let keys = patients(&["a"]);
        let allowed: HashSet<ResourceKey> = keys.iter().cloned().collect();
        let batch = planner::plan(keys, 10).remove(0);

        let err = executor
            .execute_with_retry(&batch, &allowed, &fast_policy(3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReferentialConflict { .. }));
        assert_eq!(metrics.batch_failures.get(), 1);
    }
}
