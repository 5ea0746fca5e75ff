//! Operational HTTP surface.
//!
//! `/healthz` is a liveness probe; `/status` reports per-task status strings
//! and cache counters. The user-facing UI is served elsewhere; this router
//! exposes only process-local observability.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::activity::service::{ActivityService, StatsSnapshot};

#[derive(Debug, Serialize)]
struct StatusView {
    tasks: std::collections::BTreeMap<String, String>,
    stats: StatsSnapshot,
}

pub fn router(service: ActivityService) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(service): State<ActivityService>) -> Json<StatusView> {
    Json(StatusView {
        tasks: service.status().await,
        stats: service.stats().await,
    })
}
