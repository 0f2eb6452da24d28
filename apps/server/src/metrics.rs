//! Prometheus metrics for delete-expunge jobs

use crate::{Error, Result};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

pub struct ExpungeMetrics {
    pub resources_expunged: IntCounter,
    pub entities_expunged: IntCounter,
    pub batches_executed: IntCounter,
    pub batch_failures: IntCounter,
    pub conflicts_rejected: IntCounter,
    pub jobs_finished: IntCounterVec,
}

fn metric_error(name: &str, e: prometheus::Error) -> Error {
    Error::Internal(format!("Failed to register {name} metric: {e}"))
}

impl ExpungeMetrics {
    pub fn new(registry: &Registry, prefix: &str) -> Result<Self> {
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::with_opts(Opts::new(name, help).namespace(prefix))
                .map_err(|e| metric_error(name, e))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| metric_error(name, e))?;
            Ok(counter)
        };

        let resources_expunged = counter(
            "expunged_resources_total",
            "Logical resources physically removed by delete-expunge",
        )?;
        let entities_expunged = counter(
            "expunged_entities_total",
            "Storage rows removed by delete-expunge, including history and index rows",
        )?;
        let batches_executed = counter(
            "expunge_batches_total",
            "Delete-expunge batches committed",
        )?;
        let batch_failures = counter(
            "expunge_batch_failures_total",
            "Delete-expunge batch attempts that failed",
        )?;
        let conflicts_rejected = counter(
            "expunge_conflicts_total",
            "Delete-expunge requests rejected because of referential conflicts",
        )?;

        let jobs_finished = IntCounterVec::new(
            Opts::new(
                "expunge_jobs_finished_total",
                "Delete-expunge jobs by terminal status",
            )
            .namespace(prefix),
            &["status"],
        )
        .map_err(|e| metric_error("expunge_jobs_finished_total", e))?;
        registry
            .register(Box::new(jobs_finished.clone()))
            .map_err(|e| metric_error("expunge_jobs_finished_total", e))?;

        Ok(Self {
            resources_expunged,
            entities_expunged,
            batches_executed,
            batch_failures,
            conflicts_rejected,
            jobs_finished,
        })
    }
}

/// Create a registry with process metrics plus the expunge metrics.
pub fn create_metrics_registry(prefix: &str) -> Result<(Arc<Registry>, Arc<ExpungeMetrics>)> {
    let registry = Registry::new();

    #[cfg(target_os = "linux")]
    {
        let process_collector = prometheus::process_collector::ProcessCollector::for_self();
        registry
            .register(Box::new(process_collector))
            .map_err(|e| metric_error("process", e))?;
    }

    let metrics = Arc::new(ExpungeMetrics::new(&registry, prefix)?);
    Ok((Arc::new(registry), metrics))
}
