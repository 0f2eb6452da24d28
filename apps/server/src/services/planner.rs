//! Splits a candidate set into bounded batches

use crate::models::{Batch, ResourceKey};

/// Deterministic fixed-size windows over `candidates` in key order.
///
/// The same input always yields the same plan, which is what lets a resumed job skip
/// batches recorded as done. A `batch_size` of zero is treated as one.
pub fn plan<I>(candidates: I, batch_size: usize) -> Vec<Batch>
where
    I: IntoIterator<Item = ResourceKey>,
{
    let mut keys: Vec<ResourceKey> = candidates.into_iter().collect();
    keys.sort();
    keys.dedup();

    keys.chunks(batch_size.max(1))
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            keys: chunk.to_vec(),
        })
        .collect()
}
