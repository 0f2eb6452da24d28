//! Conditional delete (`DELETE /fhir/{type}?...&_expunge=true`)

use crate::{
    models::{DeleteOutcome, DeleteRequest, RequestPartition},
    state::AppState,
    Result,
};
use axum::{
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

pub const PARTITION_HEADER: &str = "x-partition-id";

pub async fn conditional_delete(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response> {
    let partition = headers
        .get(PARTITION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(RequestPartition::from_header)
        .unwrap_or_default();

    let request =
        DeleteRequest::from_query(&resource_type, query.as_deref().unwrap_or(""))?
            .with_partition(partition);

    match state.delete_expunge.delete_by_criteria(request).await? {
        DeleteOutcome::Submitted(ack) => Ok((
            StatusCode::ACCEPTED,
            [(header::CONTENT_LOCATION, format!("/admin/jobs/{}", ack.job_id))],
            Json(ack.to_operation_outcome()),
        )
            .into_response()),
        DeleteOutcome::Immediate(outcome) => {
            Ok((StatusCode::OK, Json(outcome.to_operation_outcome())).into_response())
        }
    }
}
