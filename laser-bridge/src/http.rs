//! HTTP health endpoint.
//!
//! Serves the session manager's health snapshot and the link state as JSON.
//! Handlers only read `watch` channels, so a slow scrape never stalls the
//! bridge.

use std::time::Instant;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;

use crate::link::LinkSnapshot;
use crate::session::Health;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub health: watch::Receiver<Health>,
    pub link: watch::Receiver<LinkSnapshot>,
    pub start_time: Instant,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub sessions: Health,
    pub link: LinkSnapshot,
}

/// Creates the HTTP router with the health endpoint.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health"]
    }))
}

/// Always 200 while the process runs; `status` says whether the controller
/// link can carry data.
async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let link = *state.link.borrow();
    Json(HealthResponse {
        status: if link.state.accepts_data() {
            "healthy"
        } else {
            "connecting"
        },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        sessions: *state.health.borrow(),
        link,
    })
}
