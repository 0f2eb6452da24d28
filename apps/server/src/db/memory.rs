//! In-memory `ResourceStore` implementation.
//!
//! Mirrors the PostgreSQL table layout (`resources`, `resource_versions`,
//! `search_reference`, `search_date`) so row accounting matches between backends.
//! All tables sit behind one `RwLock`: a batch expunge holds the write lock for its
//! whole duration and readers never observe a half-removed batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::{Mutex, Notify, RwLock};
use uuid::Uuid;

use super::traits::{resource_identity, stamp_meta, ResourceStore};
use crate::{
    models::{
        BatchCounts, Conflict, PartitionId, ReferenceLink, RequestPartition, ResourceKey,
        SearchCriteria, StoredResource,
    },
    services::indexing::reference_links,
    Error, Result,
};

#[derive(Default)]
struct Tables {
    /// Every stored version, oldest first.
    resources: BTreeMap<ResourceKey, Vec<StoredResource>>,
    /// Version counter per logical resource.
    resource_versions: HashMap<ResourceKey, i32>,
    /// Outbound links of the current version, keyed by source.
    search_reference: HashMap<ResourceKey, Vec<ReferenceLink>>,
    /// Reverse lookup over `search_reference`: target -> sources.
    referrers: HashMap<ResourceKey, BTreeSet<ResourceKey>>,
    /// `_lastUpdated` row of the current version.
    search_date: HashMap<ResourceKey, DateTime<Utc>>,
    /// Remaining injected failures per key.
    failures: HashMap<ResourceKey, u32>,
}

impl Tables {
    fn current(&self, key: &ResourceKey) -> Option<&StoredResource> {
        self.resources.get(key).and_then(|versions| versions.last())
    }

    fn index(&mut self, stored: &StoredResource) {
        self.drop_outbound_links(&stored.key);
        let links = reference_links(stored);
        for link in &links {
            self.referrers
                .entry(link.target.clone())
                .or_default()
                .insert(link.source.clone());
        }
        if !links.is_empty() {
            self.search_reference.insert(stored.key.clone(), links);
        }
        self.search_date
            .insert(stored.key.clone(), stored.last_updated);
    }

    /// Remove the link rows carried by `source`. Returns the number of rows removed.
    fn drop_outbound_links(&mut self, source: &ResourceKey) -> u64 {
        let Some(links) = self.search_reference.remove(source) else {
            return 0;
        };
        for link in &links {
            if let Some(sources) = self.referrers.get_mut(&link.target) {
                sources.remove(source);
                if sources.is_empty() {
                    self.referrers.remove(&link.target);
                }
            }
        }
        links.len() as u64
    }

    /// Remove the link rows pointing at `target`. Returns the number of rows removed.
    fn drop_inbound_links(&mut self, target: &ResourceKey) -> u64 {
        let Some(sources) = self.referrers.remove(target) else {
            return 0;
        };
        let mut removed = 0;
        for source in sources {
            if let Some(links) = self.search_reference.get_mut(&source) {
                let before = links.len();
                links.retain(|link| &link.target != target);
                removed += (before - links.len()) as u64;
                if links.is_empty() {
                    self.search_reference.remove(&source);
                }
            }
        }
        removed
    }

    fn first_outside_referrer(
        &self,
        target: &ResourceKey,
        allowed_referrers: &HashSet<ResourceKey>,
    ) -> Option<Conflict> {
        let sources = self.referrers.get(target)?;
        let source = sources.iter().find(|s| !allowed_referrers.contains(*s))?;
        self.search_reference
            .get(source)?
            .iter()
            .find(|link| &link.target == target)
            .map(Conflict::from_link)
    }
}

/// Pauses one batch expunge before it touches any table.
#[derive(Default)]
pub struct BatchHold {
    reached: Notify,
    release: Notify,
}

impl BatchHold {
    /// Resolves once the held batch has started.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
pub struct InMemoryResourceStore {
    tables: RwLock<Tables>,
    holds: Mutex<HashMap<ResourceKey, Arc<BatchHold>>>,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` batch expunges that include `key` fail with a storage error.
    pub async fn inject_failure(&self, key: ResourceKey, times: u32) {
        self.tables.write().await.failures.insert(key, times);
    }

    /// Pause the next batch expunge that includes `key` until the hold is released.
    pub async fn hold_batch(&self, key: ResourceKey) -> Arc<BatchHold> {
        let hold = Arc::new(BatchHold::default());
        self.holds.lock().await.insert(key, hold.clone());
        hold
    }

    /// Total rows across every table, for asserting what an expunge removed.
    pub async fn row_count(&self) -> usize {
        let tables = self.tables.read().await;
        tables.resources.values().map(Vec::len).sum::<usize>()
            + tables.resource_versions.len()
            + tables.search_reference.values().map(Vec::len).sum::<usize>()
            + tables.search_date.len()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn create(
        &self,
        mut resource: JsonValue,
        partition: PartitionId,
    ) -> Result<StoredResource> {
        let (resource_type, id) = resource_identity(&resource)?;
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = ResourceKey::new(resource_type, id);

        let mut tables = self.tables.write().await;
        if tables.resource_versions.contains_key(&key) {
            return Err(Error::Validation(format!("Resource {} already exists", key)));
        }

        let now = Utc::now();
        stamp_meta(&mut resource, &key.id, 1, now);
        let stored = StoredResource {
            key: key.clone(),
            version_id: 1,
            partition,
            resource,
            last_updated: now,
        };

        tables.resource_versions.insert(key.clone(), 1);
        tables.index(&stored);
        tables.resources.insert(key, vec![stored.clone()]);
        Ok(stored)
    }

    async fn update(&self, mut resource: JsonValue) -> Result<StoredResource> {
        let (resource_type, id) = resource_identity(&resource)?;
        let id = id.ok_or_else(|| Error::InvalidResource("Missing id field".to_string()))?;
        let key = ResourceKey::new(resource_type, id);

        let mut tables = self.tables.write().await;
        let partition = tables
            .current(&key)
            .map(|current| current.partition.clone())
            .ok_or_else(|| Error::ResourceNotFound {
                resource_type: key.resource_type.clone(),
                id: key.id.clone(),
            })?;

        let version_id = {
            let counter = tables.resource_versions.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let now = Utc::now();
        stamp_meta(&mut resource, &key.id, version_id, now);
        let stored = StoredResource {
            key: key.clone(),
            version_id,
            partition,
            resource,
            last_updated: now,
        };

        tables.index(&stored);
        tables
            .resources
            .entry(key)
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn read(&self, key: &ResourceKey) -> Result<Option<StoredResource>> {
        Ok(self.tables.read().await.current(key).cloned())
    }

    async fn count(&self, resource_type: &str) -> Result<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .resources
            .keys()
            .filter(|key| key.resource_type == resource_type)
            .count() as u64)
    }

    async fn find_candidates(
        &self,
        criteria: &SearchCriteria,
        partition: &RequestPartition,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ResourceKey>> {
        let tables = self.tables.read().await;
        Ok(tables
            .resources
            .values()
            .filter_map(|versions| versions.last())
            .filter(|current| criteria.matches(current) && partition.contains(&current.partition))
            .skip(offset)
            .take(limit)
            .map(|current| current.key.clone())
            .collect())
    }

    async fn incoming_links(&self, targets: &[ResourceKey]) -> Result<Vec<ReferenceLink>> {
        let tables = self.tables.read().await;
        let mut links = Vec::new();
        for target in targets {
            let Some(sources) = tables.referrers.get(target) else {
                continue;
            };
            for source in sources {
                if let Some(outbound) = tables.search_reference.get(source) {
                    links.extend(outbound.iter().filter(|l| &l.target == target).cloned());
                }
            }
        }
        Ok(links)
    }

    async fn outgoing_links(&self, source: &ResourceKey) -> Result<Vec<ReferenceLink>> {
        let tables = self.tables.read().await;
        Ok(tables
            .search_reference
            .get(source)
            .cloned()
            .unwrap_or_default())
    }

    async fn expunge_batch(
        &self,
        keys: &[ResourceKey],
        allowed_referrers: &HashSet<ResourceKey>,
    ) -> Result<BatchCounts> {
        let hold = {
            let mut holds = self.holds.lock().await;
            keys.iter().find_map(|key| holds.remove(key))
        };
        if let Some(hold) = hold {
            hold.reached.notify_one();
            hold.release.notified().await;
        }

        let mut tables = self.tables.write().await;

        for key in keys {
            if let Some(remaining) = tables.failures.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Internal(format!(
                        "Storage failure while expunging {}",
                        key
                    )));
                }
            }
        }

        for key in keys {
            if let Some(conflict) = tables.first_outside_referrer(key, allowed_referrers) {
                return Err(conflict.into());
            }
        }

        let mut counts = BatchCounts::default();
        for key in keys {
            let versions = tables.resources.remove(key).map(|v| v.len()).unwrap_or(0) as u64;
            let counter = u64::from(tables.resource_versions.remove(key).is_some());
            if versions == 0 && counter == 0 {
                continue;
            }
            let dates = u64::from(tables.search_date.remove(key).is_some());
            let outbound = tables.drop_outbound_links(key);
            let inbound = tables.drop_inbound_links(key);

            counts.resources_expunged += 1;
            counts.entities_expunged += versions + counter + dates + outbound + inbound;
        }
        Ok(counts)
    }
}
