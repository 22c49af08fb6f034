pub mod dto;
pub mod errors;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::alerts::AlertEngine;
use crate::cache::CacheBackend;
use crate::ingest::IngestService;
use crate::realtime::FanoutHub;
use crate::repo::DeviceRepository;
use crate::upstream::Upstream;

use handlers::ApiDoc;

/// Everything the HTTP layer needs, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn DeviceRepository>,
    pub cache: Arc<dyn CacheBackend>,
    pub hub: FanoutHub,
    pub ingest: Arc<IngestService>,
    pub alerts: AlertEngine,
    pub upstream: Arc<dyn Upstream>,
}

pub fn router(state: AppState) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/ingest", post(handlers::ingest))
        .route("/devices/{id}/state", get(handlers::get_device_state))
        .route("/devices/{id}/alerts", get(handlers::get_device_alerts))
        .route("/devices/{id}/backfill", post(handlers::backfill_device))
        .route("/alerts/{id}/acknowledge", post(handlers::acknowledge_alert))
        .route("/alerts/{id}/resolve", post(handlers::resolve_alert))
        .route("/ws", get(handlers::ws_upgrade))
        .with_state(state)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
