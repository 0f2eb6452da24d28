use crate::{state::AppState, Error, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;

pub async fn health(State(state): State<AppState>) -> Result<Response> {
    let queue = state.job_queue.health_check().await?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "jobs": queue,
        })),
    )
        .into_response())
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<AppState>) -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics_registry.gather();

    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response())
}
