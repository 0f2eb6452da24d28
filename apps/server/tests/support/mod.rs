//! Shared integration test harness.
//!
//! Every test gets its own in-memory store, job queue and router, so tests run in
//! parallel without a database.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{HeaderMap, Method, Request, StatusCode},
    Router,
};
use cinder::{
    api::create_router,
    config::Config,
    db::{InMemoryResourceStore, ResourceStore},
    models::{PartitionId, ResourceKey, StoredResource},
    queue::InMemoryJobQueue,
    state::AppState,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

pub type TestFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<InMemoryResourceStore>,
    router: Router,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.workers.poll_interval_ms = 10;
    config.expunge.batch_retry_backoff_ms = 1;
    config
}

pub async fn with_test_app<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce(TestApp) -> TestFuture,
{
    with_test_app_with_config(|_| {}, f).await
}

pub async fn with_test_app_with_config<C, F>(configure: C, f: F) -> anyhow::Result<()>
where
    C: FnOnce(&mut Config),
    F: FnOnce(TestApp) -> TestFuture,
{
    let mut config = test_config();
    configure(&mut config);

    let store = Arc::new(InMemoryResourceStore::new());
    let state = AppState::with_backends(
        config,
        store.clone(),
        Arc::new(InMemoryJobQueue::new()),
    )?;
    let router = create_router(state.clone());

    f(TestApp {
        state,
        store,
        router,
    })
    .await
}

impl TestApp {
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Vec<u8>)> {
        self.request_with_headers(method, path, &[], body).await
    }

    pub async fn request_with_headers(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Vec<u8>)> {
        let mut builder = Request::builder().method(method).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(bytes) => builder
                .header("content-type", "application/fhir+json")
                .body(Body::from(bytes))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        Ok((status, headers, body.to_vec()))
    }

    pub async fn get_json(&self, path: &str) -> anyhow::Result<(StatusCode, Value)> {
        let (status, _headers, body) = self.request(Method::GET, path, None).await?;
        Ok((status, serde_json::from_slice(&body)?))
    }

    /// Store a resource in the default partition.
    pub async fn create(&self, resource: Value) -> anyhow::Result<StoredResource> {
        self.create_in(resource, PartitionId::DEFAULT).await
    }

    pub async fn create_in(
        &self,
        resource: Value,
        partition: &str,
    ) -> anyhow::Result<StoredResource> {
        Ok(self
            .store
            .create(resource, PartitionId::new(partition))
            .await?)
    }

    pub async fn exists(&self, resource_type: &str, id: &str) -> anyhow::Result<bool> {
        Ok(self
            .store
            .read(&ResourceKey::new(resource_type, id))
            .await?
            .is_some())
    }

    pub async fn count(&self, resource_type: &str) -> anyhow::Result<u64> {
        Ok(self.store.count(resource_type).await?)
    }

    /// Issue a conditional delete and return the status, job id (if any) and body.
    pub async fn delete_expunge(
        &self,
        path: &str,
        partition: Option<&str>,
    ) -> anyhow::Result<(StatusCode, Option<Uuid>, Value)> {
        let headers: Vec<(&str, &str)> = partition
            .map(|p| vec![("x-partition-id", p)])
            .unwrap_or_default();
        let (status, headers, body) = self
            .request_with_headers(Method::DELETE, path, &headers, None)
            .await?;

        let job_id = headers
            .get("content-location")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .map(Uuid::parse_str)
            .transpose()?;
        Ok((status, job_id, serde_json::from_slice(&body)?))
    }

    /// Wait for a job and return its outcome OperationOutcome.
    pub async fn await_outcome(&self, job_id: Uuid) -> anyhow::Result<Value> {
        let (status, outcome) = self
            .get_json(&format!("/admin/jobs/{}/outcome?waitMs=10000", job_id))
            .await?;
        assert_status(status, StatusCode::OK, "job outcome");
        Ok(outcome)
    }

    /// Poll until the job has committed at least `batches` batches.
    pub async fn wait_for_processed(&self, job_id: Uuid, batches: i64) -> anyhow::Result<()> {
        for _ in 0..1000 {
            let job = self.job(job_id).await?;
            if job["processedItems"].as_i64().unwrap_or(0) >= batches {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        anyhow::bail!("job {} never reached {} processed batch(es)", job_id, batches)
    }

    pub async fn job(&self, job_id: Uuid) -> anyhow::Result<Value> {
        let (status, job) = self.get_json(&format!("/admin/jobs/{}", job_id)).await?;
        assert_status(status, StatusCode::OK, "get job");
        Ok(job)
    }
}

pub fn assert_status(actual: StatusCode, expected: StatusCode, context: &str) {
    assert_eq!(
        actual, expected,
        "{}: expected {}, got {}",
        context, expected, actual
    );
}

pub fn diagnostics(outcome: &Value) -> &str {
    outcome["issue"][0]["diagnostics"].as_str().unwrap_or_default()
}

/// Value of a count extension on an outcome OperationOutcome.
pub fn outcome_count(outcome: &Value, url: &str) -> i64 {
    outcome["extension"]
        .as_array()
        .and_then(|exts| exts.iter().find(|e| e["url"] == url))
        .and_then(|e| e["valueInteger"].as_i64())
        .unwrap_or(-1)
}

pub fn expunged_resources(outcome: &Value) -> i64 {
    outcome_count(outcome, "expungedResourcesCount")
}

pub fn expunged_entities(outcome: &Value) -> i64 {
    outcome_count(outcome, "expungedEntitiesCount")
}

pub fn organization(id: &str) -> Value {
    json!({
        "resourceType": "Organization",
        "id": id,
        "name": format!("Organization {}", id)
    })
}

pub struct PatientBuilder {
    resource: Value,
}

impl PatientBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            resource: json!({
                "resourceType": "Patient",
                "id": id,
                "name": [{ "family": "Test", "given": [id] }]
            }),
        }
    }

    pub fn managing_organization(mut self, reference: impl Into<String>) -> Self {
        self.resource["managingOrganization"] = json!({ "reference": reference.into() });
        self
    }

    pub fn link_other(mut self, reference: impl Into<String>) -> Self {
        let link = json!({ "other": { "reference": reference.into() }, "type": "seealso" });
        match self.resource.get_mut("link").and_then(Value::as_array_mut) {
            Some(links) => links.push(link),
            None => self.resource["link"] = json!([link]),
        }
        self
    }

    pub fn build(self) -> Value {
        self.resource
    }
}
