//! Referential conflict detection for a delete candidate set

use std::collections::BTreeSet;
use std::sync::Arc;

use super::reference_index::ReferenceIndex;
use crate::{
    models::{Conflict, ResourceKey},
    Result,
};

pub struct ConflictDetector {
    index: Arc<ReferenceIndex>,
}

impl ConflictDetector {
    pub fn new(index: Arc<ReferenceIndex>) -> Self {
        Self { index }
    }

    /// Every incoming link to a candidate whose source is not itself a candidate.
    ///
    /// The whole set is evaluated at once, never batch by batch: a referrer that sits in
    /// a later batch is still inside the set and does not conflict.
    pub async fn detect_conflicts(
        &self,
        candidates: &BTreeSet<ResourceKey>,
    ) -> Result<BTreeSet<Conflict>> {
        let targets: Vec<ResourceKey> = candidates.iter().cloned().collect();
        let links = self.index.referrers_of_all(&targets).await?;

        Ok(links
            .iter()
            .filter(|link| !candidates.contains(&link.source))
            .map(Conflict::from_link)
            .collect())
    }

    /// Fail with the first conflict (in key order) if there is any.
    pub async fn ensure_conflict_free(&self, candidates: &BTreeSet<ResourceKey>) -> Result<()> {
        let conflicts = self.detect_conflicts(candidates).await?;
        match conflicts.into_iter().next() {
            Some(conflict) => {
                tracing::info!(
                    target_resource = %conflict.target,
                    referrer = %conflict.referrer,
                    path = %conflict.path,
                    "Delete-expunge rejected: candidate still referenced"
                );
                Err(conflict.into())
            }
            None => Ok(()),
        }
    }
}
