//! Derived index rows kept alongside stored resources.
//!
//! Every stored version contributes one `search_date` row (`_lastUpdated`) and one
//! `search_reference` row per distinct relative reference it carries.

use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

use crate::models::{ReferenceLink, ResourceKey, StoredResource};

/// Name of the date index row every resource carries.
pub const LAST_UPDATED_PARAM: &str = "_lastUpdated";

/// Reference links carried by a stored resource, one per distinct `(path, target)`.
pub fn reference_links(stored: &StoredResource) -> Vec<ReferenceLink> {
    let mut found = BTreeSet::new();
    collect_relative_refs(
        &stored.resource,
        &stored.key.resource_type,
        &mut found,
    );
    found
        .into_iter()
        .map(|(path, target)| ReferenceLink {
            source: stored.key.clone(),
            source_partition: stored.partition.clone(),
            path,
            target,
        })
        .collect()
}

/// Walk the JSON tree and collect relative `Type/id` references with their element path.
///
/// Array positions are not part of the path. Fragments (`#...`), absolute URLs and
/// URN references are skipped.
fn collect_relative_refs(
    value: &JsonValue,
    path: &str,
    out: &mut BTreeSet<(String, ResourceKey)>,
) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                collect_relative_refs(item, path, out);
            }
        }
        JsonValue::Object(obj) => {
            if let Some(reference) = obj.get("reference").and_then(|v| v.as_str()) {
                if let Some(target) = parse_relative_reference(reference) {
                    out.insert((path.to_string(), target));
                }
            }
            for (name, child) in obj {
                if matches!(child, JsonValue::Object(_) | JsonValue::Array(_)) {
                    collect_relative_refs(child, &format!("{}.{}", path, name), out);
                }
            }
        }
        _ => {}
    }
}

fn parse_relative_reference(reference: &str) -> Option<ResourceKey> {
    let trimmed = reference.trim();
    if trimmed.is_empty()
        || trimmed.starts_with('#')
        || trimmed.contains("://")
        || trimmed.starts_with("urn:")
    {
        return None;
    }
    ResourceKey::parse(trimmed).ok()
}
