//! Shared application state

use crate::{
    config::{Config, StorageBackend},
    db::{InMemoryResourceStore, PostgresResourceStore, ResourceStore},
    metrics::{create_metrics_registry, ExpungeMetrics},
    queue::{InMemoryJobQueue, JobQueue, PostgresJobQueue},
    services::{
        ConflictDetector, DeleteExpungeExecutor, DeleteExpungeService, JobOrchestrator,
        ReferenceIndex,
    },
    workers::DeleteExpungeWorker,
    Result,
};
use prometheus::Registry;
use sqlx::PgPool;
use std::sync::Arc;

const METRICS_PREFIX: &str = "cinder";

/// Shared application state passed to all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ResourceStore>,
    pub job_queue: Arc<dyn JobQueue>,
    pub reference_index: Arc<ReferenceIndex>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub delete_expunge: Arc<DeleteExpungeService>,
    pub metrics_registry: Arc<Registry>,
    pub metrics: Arc<ExpungeMetrics>,
}

impl AppState {
    /// Initialize the application state for the configured storage backend
    pub async fn new(config: Config) -> Result<Self> {
        tracing::info!(backend = ?config.database.backend, "Initializing application state...");

        match config.database.backend {
            StorageBackend::Memory => Self::with_backends(
                config,
                Arc::new(InMemoryResourceStore::new()),
                Arc::new(InMemoryJobQueue::new()),
            ),
            StorageBackend::Postgres => {
                let db_pool = create_db_pool(&config).await?;

                if config.database.run_migrations {
                    tracing::info!("Running database migrations...");
                    sqlx::migrate!("./migrations")
                        .run(&db_pool)
                        .await
                        .map_err(|e| match e {
                            sqlx::migrate::MigrateError::Execute(db_err) => {
                                crate::Error::Database(db_err)
                            }
                            other => {
                                crate::Error::Internal(format!("Migration failed: {}", other))
                            }
                        })?;
                }

                let state = Self::with_backends(
                    config,
                    Arc::new(PostgresResourceStore::new(db_pool.clone())),
                    Arc::new(PostgresJobQueue::new(db_pool)),
                )?;

                let resumed = state.orchestrator.resume_interrupted().await?;
                if resumed > 0 {
                    tracing::info!(resumed, "Resumed interrupted jobs");
                }
                Ok(state)
            }
        }
    }

    /// Wire the engine on top of the given store and job queue
    pub fn with_backends(
        config: Config,
        store: Arc<dyn ResourceStore>,
        job_queue: Arc<dyn JobQueue>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let (metrics_registry, metrics) = create_metrics_registry(METRICS_PREFIX)?;

        let reference_index = Arc::new(ReferenceIndex::new(
            store.clone(),
            config.expunge.internal_synchronous_search_size,
        ));
        let executor = Arc::new(DeleteExpungeExecutor::new(store.clone(), metrics.clone()));

        let mut orchestrator = JobOrchestrator::new(job_queue.clone(), &config.workers);
        orchestrator.register(Arc::new(DeleteExpungeWorker::new(
            job_queue.clone(),
            executor,
            metrics.clone(),
        )));
        let orchestrator = Arc::new(orchestrator);

        let delete_expunge = Arc::new(DeleteExpungeService::new(
            store.clone(),
            ConflictDetector::new(reference_index.clone()),
            orchestrator.clone(),
            config.expunge.clone(),
            metrics.clone(),
        ));

        tracing::info!("Application state initialized");

        Ok(Self {
            config,
            store,
            job_queue,
            reference_index,
            orchestrator,
            delete_expunge,
            metrics_registry,
            metrics,
        })
    }
}

async fn create_db_pool(config: &Config) -> Result<PgPool> {
    tracing::info!("Creating database connection pool...");

    let statement_timeout = config.database.statement_timeout_seconds;
    let lock_timeout = config.database.lock_timeout_seconds;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .min_connections(config.database.pool_min_size)
        .max_connections(config.database.pool_max_size)
        .acquire_timeout(std::time::Duration::from_secs(
            config.database.pool_timeout_seconds,
        ))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = '{}s'", statement_timeout))
                    .execute(&mut *conn)
                    .await?;

                // Batches waiting on contended rows fail fast and are retried
                sqlx::query(&format!("SET lock_timeout = '{}s'", lock_timeout))
                    .execute(&mut *conn)
                    .await?;

                Ok(())
            })
        })
        .connect(&config.database.url)
        .await
        .map_err(crate::Error::Database)?;

    tracing::info!(
        "Database pool created (min: {}, max: {})",
        config.database.pool_min_size,
        config.database.pool_max_size
    );

    Ok(pool)
}
