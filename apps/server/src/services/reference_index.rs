//! Who points at what.
//!
//! Every lookup reads committed link rows straight from the store and spans all
//! partitions, so no partition-scoped or cached view can approve an unsafe delete.

use std::sync::Arc;

use crate::{
    db::ResourceStore,
    models::{ReferenceLink, RequestPartition, ResourceKey},
    Result,
};

pub struct ReferenceIndex {
    store: Arc<dyn ResourceStore>,
    /// Targets looked up per store round trip.
    lookup_chunk: usize,
}

impl ReferenceIndex {
    pub fn new(store: Arc<dyn ResourceStore>, lookup_chunk: usize) -> Self {
        Self {
            store,
            lookup_chunk: lookup_chunk.max(1),
        }
    }

    /// Links whose target is `target`, from any partition.
    pub async fn referrers_of(&self, target: &ResourceKey) -> Result<Vec<ReferenceLink>> {
        self.store.incoming_links(std::slice::from_ref(target)).await
    }

    /// Links whose target is any of `targets`, from any partition.
    pub async fn referrers_of_all(&self, targets: &[ResourceKey]) -> Result<Vec<ReferenceLink>> {
        let mut links = Vec::new();
        for chunk in targets.chunks(self.lookup_chunk) {
            links.extend(self.store.incoming_links(chunk).await?);
        }
        Ok(links)
    }

    /// Links whose target is `target`, restricted to referrers living in `scope`.
    pub async fn referrers_in(
        &self,
        target: &ResourceKey,
        scope: &RequestPartition,
    ) -> Result<Vec<ReferenceLink>> {
        let mut links = self.referrers_of(target).await?;
        links.retain(|link| scope.contains(&link.source_partition));
        Ok(links)
    }

    /// Links carried by `source`.
    pub async fn references_from(&self, source: &ResourceKey) -> Result<Vec<ReferenceLink>> {
        self.store.outgoing_links(source).await
    }
}
