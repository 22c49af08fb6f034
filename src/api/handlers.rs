use std::time::Duration;

use axum::{
    extract::{
        ws::WebSocketUpgrade,
        Path, Query, State,
    },
    response::Response,
    Json,
};
use serde::Deserialize;
use tracing::warn;
use utoipa::OpenApi;
use uuid::Uuid;

use super::dto::{
    AcknowledgeRequest, BackfillRequest, IngestReading, IngestRequest, IngestResponse,
    ResolveRequest,
};
use super::errors::AppError;
use super::AppState;
use crate::db::models::{
    AlertCategory, AlertEvent, CompareOp, Device, DeviceState, DeviceStatus, Severity,
};
use crate::errors::CoreError;
use crate::realtime::ws::serve_socket;

/// TTL of cached device-state responses.
const STATE_CACHE_TTL: Duration = Duration::from_secs(30);

fn state_cache_key(device_id: Uuid) -> String {
    format!("nodes:state:{device_id}")
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Ingest a batch of readings pushed directly by a device or collector.
#[utoipa::path(
    post,
    path = "/ingest",
    request_body = IngestRequest,
    responses(
        (status = 200, description = "Batch ingested", body = IngestResponse),
        (status = 404, description = "Unknown device key"),
        (status = 422, description = "Malformed batch"),
    ),
    tag = "telemetry"
)]
pub async fn ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    if req.device_key.trim().is_empty() {
        return Err(CoreError::ValidationFailure("device_key must not be empty".into()).into());
    }
    if req.readings.is_empty() {
        return Err(CoreError::ValidationFailure("readings must not be empty".into()).into());
    }

    let device_key = req.device_key.clone();
    let batch = req.into_readings();
    let summary = state.ingest.process_by_key(&device_key, &batch).await?;
    Ok(Json(IngestResponse {
        readings_stored: summary.readings_stored,
    }))
}

/// Current derived state of one device. Responses are served from the cache
/// for a short TTL; the polling cycle invalidates the namespace on change.
#[utoipa::path(
    get,
    path = "/devices/{id}/state",
    params(("id" = Uuid, Path, description = "Device ID")),
    responses(
        (status = 200, description = "Device state", body = DeviceState),
        (status = 404, description = "Unknown device"),
    ),
    tag = "telemetry"
)]
pub async fn get_device_state(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeviceState>, AppError> {
    let key = state_cache_key(id);
    if let Some(cached) = state.cache.get(&key).await {
        match serde_json::from_str::<DeviceState>(&cached) {
            Ok(device_state) => return Ok(Json(device_state)),
            // Stale shape after an upgrade: drop it and rebuild.
            Err(e) => {
                warn!(key = %key, error = %e, "discarding undecodable cache entry");
                state.cache.delete(&key).await;
            }
        }
    }

    require_device(&state, id).await?;
    let device_state = state.repo.get_or_create_device_state(id).await?;
    if let Ok(serialized) = serde_json::to_string(&device_state) {
        state.cache.set(&key, serialized, STATE_CACHE_TTL).await;
    }
    Ok(Json(device_state))
}

/// Pull provider history for a device through the ingestion pipeline; used
/// to repair gaps after outages.
#[utoipa::path(
    post,
    path = "/devices/{id}/backfill",
    params(("id" = Uuid, Path, description = "Device ID")),
    request_body = BackfillRequest,
    responses(
        (status = 200, description = "History ingested", body = IngestResponse),
        (status = 404, description = "Unknown device"),
        (status = 422, description = "Invalid window"),
    ),
    tag = "telemetry"
)]
pub async fn backfill_device(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<BackfillRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    if req.days == 0 || req.days > 365 {
        return Err(
            CoreError::ValidationFailure("days must be between 1 and 365".into()).into(),
        );
    }

    let device = require_device(&state, id).await?;
    let history = state.upstream.fetch_history(&device, req.days).await;
    let summary = state.ingest.process_readings(device.id, &history).await?;
    Ok(Json(IngestResponse {
        readings_stored: summary.readings_stored,
    }))
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// All alert events of one device, newest first.
#[utoipa::path(
    get,
    path = "/devices/{id}/alerts",
    params(("id" = Uuid, Path, description = "Device ID")),
    responses(
        (status = 200, description = "Alert events", body = Vec<AlertEvent>),
        (status = 404, description = "Unknown device"),
    ),
    tag = "alerts"
)]
pub async fn get_device_alerts(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<AlertEvent>>, AppError> {
    require_device(&state, id).await?;
    Ok(Json(state.repo.alerts_for_device(id).await?))
}

/// Acknowledge an open alert event.
#[utoipa::path(
    post,
    path = "/alerts/{id}/acknowledge",
    params(("id" = Uuid, Path, description = "Alert event ID")),
    request_body = AcknowledgeRequest,
    responses(
        (status = 200, description = "Acknowledged", body = AlertEvent),
        (status = 409, description = "Already resolved"),
    ),
    tag = "alerts"
)]
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AcknowledgeRequest>,
) -> Result<Json<AlertEvent>, AppError> {
    Ok(Json(state.alerts.acknowledge(id, &req.by).await?))
}

/// Resolve an alert event, auto-acknowledging it when needed.
#[utoipa::path(
    post,
    path = "/alerts/{id}/resolve",
    params(("id" = Uuid, Path, description = "Alert event ID")),
    request_body = ResolveRequest,
    responses(
        (status = 200, description = "Resolved", body = AlertEvent),
        (status = 409, description = "Already resolved"),
    ),
    tag = "alerts"
)]
pub async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<AlertEvent>, AppError> {
    let actor = req.by.as_deref().unwrap_or("api");
    Ok(Json(
        state
            .alerts
            .resolve(id, req.comment.as_deref(), actor)
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Realtime
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Optional caller-chosen identifier, surfaced in connection logs.
    pub client_id: Option<String>,
}

/// Upgrade to the realtime WebSocket channel.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state.hub.clone(), params.client_id))
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn require_device(state: &AppState, id: Uuid) -> Result<Device, AppError> {
    Ok(state
        .repo
        .get_device(id)
        .await?
        .ok_or_else(|| CoreError::DeviceNotFound(id.to_string()))?)
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(
        ingest,
        get_device_state,
        backfill_device,
        get_device_alerts,
        acknowledge_alert,
        resolve_alert,
        health,
    ),
    components(schemas(
        IngestRequest,
        IngestReading,
        IngestResponse,
        AcknowledgeRequest,
        ResolveRequest,
        BackfillRequest,
        DeviceState,
        AlertEvent,
        DeviceStatus,
        Severity,
        AlertCategory,
        CompareOp,
    )),
    tags(
        (name = "telemetry", description = "Reading ingestion and device state"),
        (name = "alerts",    description = "Alert lifecycle endpoints"),
        (name = "system",    description = "System endpoints"),
    ),
    info(
        title = "GridWatch Service API",
        version = "0.1.0",
        description = "Telemetry backend for distributed field devices"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
