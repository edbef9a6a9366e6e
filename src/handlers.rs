// HTTP request handlers
//
// Event publish endpoint plus health and readiness checks

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use metrics::counter;
use serde_json::{json, Value};
use tracing::debug;

use crate::{AppError, AppState};

/// Header carrying the tenant id, used as the broker routing key.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// POST /v1/events - publish one event (JSON object) or many (JSON array)
pub(crate) async fn publish_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let tenant = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    debug!(
        "Received publish request ({} bytes, tenant: {:?})",
        body.len(),
        tenant
    );

    let max_payload = state.max_payload_bytes;
    if body.len() > max_payload {
        counter!("archiver.ingest.rejected", 1);
        return Err(AppError::with_status(
            StatusCode::PAYLOAD_TOO_LARGE,
            anyhow::anyhow!("payload {} exceeds limit {}", body.len(), max_payload),
        ));
    }

    let events = split_events(&body).map_err(|e| {
        counter!("archiver.ingest.rejected", 1);
        AppError::bad_request(e)
    })?;

    let key = tenant.map(|t| Bytes::copy_from_slice(t.as_bytes()));
    for event in &events {
        state
            .broker
            .publish(&state.topic, key.clone(), Some(event.clone()))
            .map_err(AppError::internal)?;
    }

    Ok((
        StatusCode::OK,
        Json(json!({"ok": true, "published": events.len()})),
    )
        .into_response())
}

/// GET /health - Basic health check
pub(crate) async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "healthy"})))
}

/// GET /ready - Ready while the engine still accepts records
pub(crate) async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.engine.is_closed() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "shutting down"})),
        )
    } else {
        (
            StatusCode::OK,
            Json(json!({"status": "ready", "buffered": state.engine.buffered()})),
        )
    }
}

/// A JSON object is published verbatim; array elements become one message each.
fn split_events(body: &Bytes) -> anyhow::Result<Vec<Bytes>> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| anyhow::anyhow!("request body is not valid JSON: {}", e))?;

    match value {
        Value::Object(_) => Ok(vec![body.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| serde_json::to_vec(item).map(Bytes::from))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into),
        _ => anyhow::bail!("expected a JSON object or an array of events"),
    }
}
