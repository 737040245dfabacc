//! Observability handlers
//!
//! `/health`, `/telemetry`, `/metrics` and the HTTP event replay window.
//! All of them answer 200 even when every backend dependency is down;
//! unreachable values render as `unknown`.

use crate::api::routes::AppState;
use crate::telemetry;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

/// Hard cap on the replay window size
const MAX_REPLAY_EVENTS: usize = 10_000;

/// Handler for `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(telemetry::health(&state.handles).await)
}

/// Handler for `GET /telemetry`
pub async fn telemetry(State(state): State<AppState>) -> impl IntoResponse {
    Json(telemetry::snapshot(&state.handles).await)
}

/// Handler for `GET /metrics`
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::prometheus(&state.handles).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

/// Query for `GET /v1/events`
#[derive(Debug, Deserialize)]
pub struct EventsWindowQuery {
    /// First sequence number (inclusive)
    #[serde(default)]
    pub seq_from: u64,
    /// Last sequence number (inclusive)
    pub seq_to: Option<u64>,
}

/// Handler for `GET /v1/events`: the HTTP replay window.
pub async fn events_window(
    State(state): State<AppState>,
    Query(query): Query<EventsWindowQuery>,
) -> impl IntoResponse {
    let seq_to = query.seq_to.unwrap_or(u64::MAX);
    match state.handles.bus.log().read_range(query.seq_from, seq_to) {
        Ok(mut events) => {
            let truncated = events.len() > MAX_REPLAY_EVENTS;
            events.truncate(MAX_REPLAY_EVENTS);
            Json(json!({
                "events": events,
                "truncated": truncated,
            }))
        }
        Err(e) => {
            tracing::warn!("Event replay window unavailable: {}", e);
            Json(json!({
                "events": [],
                "truncated": false,
                "error": "log_unavailable",
            }))
        }
    }
}
