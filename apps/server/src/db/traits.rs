//! Storage trait shared by the in-memory and PostgreSQL backends

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashSet;

use crate::{
    models::{
        BatchCounts, PartitionId, ReferenceLink, RequestPartition, ResourceKey, SearchCriteria,
        StoredResource,
    },
    Result,
};

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Store the first version of a resource in `partition`. A missing `id` is assigned.
    async fn create(&self, resource: JsonValue, partition: PartitionId) -> Result<StoredResource>;

    /// Append a new current version and rebuild its index rows.
    async fn update(&self, resource: JsonValue) -> Result<StoredResource>;

    /// Current version of a resource.
    async fn read(&self, key: &ResourceKey) -> Result<Option<StoredResource>>;

    /// Number of logical resources of a type.
    async fn count(&self, resource_type: &str) -> Result<u64>;

    /// One page of keys matching `criteria` within `partition`, ordered by key.
    async fn find_candidates(
        &self,
        criteria: &SearchCriteria,
        partition: &RequestPartition,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ResourceKey>>;

    /// Committed links pointing at any of `targets`, across every partition.
    async fn incoming_links(&self, targets: &[ResourceKey]) -> Result<Vec<ReferenceLink>>;

    /// Committed links carried by `source`.
    async fn outgoing_links(&self, source: &ResourceKey) -> Result<Vec<ReferenceLink>>;

    /// Physically remove `keys` with all their versions, links and index rows as one
    /// atomic unit.
    ///
    /// Before anything is removed, incoming links are checked again: a link from a
    /// source outside `allowed_referrers` fails the whole batch with
    /// `Error::ReferentialConflict`. Keys that are already gone are skipped.
    async fn expunge_batch(
        &self,
        keys: &[ResourceKey],
        allowed_referrers: &HashSet<ResourceKey>,
    ) -> Result<BatchCounts>;
}

/// Resource type and id of an incoming resource body. Missing ids are generated.
pub(crate) fn resource_identity(resource: &JsonValue) -> Result<(String, Option<String>)> {
    let resource_type = resource
        .get("resourceType")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            crate::Error::InvalidResource("Missing resourceType field".to_string())
        })?
        .to_string();
    let id = resource
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Ok((resource_type, id))
}

/// Write `id`, `meta.versionId` and `meta.lastUpdated` into a resource body.
pub(crate) fn stamp_meta(
    resource: &mut JsonValue,
    id: &str,
    version_id: i32,
    last_updated: chrono::DateTime<chrono::Utc>,
) {
    if let Some(obj) = resource.as_object_mut() {
        obj.insert("id".to_string(), JsonValue::String(id.to_string()));
        let meta = obj
            .entry("meta")
            .or_insert_with(|| JsonValue::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert(
                "versionId".to_string(),
                JsonValue::String(version_id.to_string()),
            );
            meta.insert(
                "lastUpdated".to_string(),
                JsonValue::String(last_updated.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            );
        }
    }
}
