//! Reference lookups for a single resource

use crate::{
    models::{ReferenceLink, RequestPartition, ResourceKey},
    state::AppState,
    Result,
};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::delete::PARTITION_HEADER;

fn link_json(link: &ReferenceLink) -> serde_json::Value {
    json!({
        "source": link.source.to_string(),
        "sourcePartition": link.source_partition,
        "path": link.path,
        "target": link.target.to_string(),
    })
}

/// Incoming and outgoing references of a resource.
///
/// Incoming links are filtered by `X-Partition-Id` when present; without the header
/// every partition is listed.
pub async fn get_resource_references(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let key = ResourceKey::new(resource_type, id);
    if state.store.read(&key).await?.is_none() {
        return Err(crate::Error::ResourceNotFound {
            resource_type: key.resource_type,
            id: key.id,
        });
    }

    let scope = headers
        .get(PARTITION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(RequestPartition::from_header)
        .unwrap_or_default();

    let incoming = state.reference_index.referrers_in(&key, &scope).await?;
    let outgoing = state.reference_index.references_from(&key).await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "resource": key.to_string(),
            "incoming": incoming.iter().map(link_json).collect::<Vec<_>>(),
            "outgoing": outgoing.iter().map(link_json).collect::<Vec<_>>(),
        })),
    )
        .into_response())
}
