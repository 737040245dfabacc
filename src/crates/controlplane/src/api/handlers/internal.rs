//! Operator surface
//!
//! Flag changes, log replay and the preflight route check. These wrap the
//! same primitives the CLI tooling calls.

use crate::api::routes::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use events::{EventDraft, EventKind, LogPosition};
use serde::Deserialize;
use serde_json::json;

/// Body for `POST /internal/flags`
#[derive(Debug, Deserialize)]
pub struct SetFlagBody {
    /// Flag name
    pub name: String,
    /// New value
    pub value: String,
}

/// Handler for `POST /internal/flags`
///
/// Updates the in-memory store and emits `feature_flag.updated`; the
/// materializer projects the change into the graph.
pub async fn set_flag(
    State(state): State<AppState>,
    Json(body): Json<SetFlagBody>,
) -> impl IntoResponse {
    state.handles.flags.set(body.name.clone(), body.value.clone());
    let event = state.handles.bus.publish(
        EventDraft::new(EventKind::FeatureFlagUpdated)
            .with_payload(json!({"name": &body.name, "value": &body.value})),
    );

    Json(json!({
        "ok": true,
        "name": body.name,
        "value": body.value,
        "event_id": event.event_id,
    }))
}

/// Body for `POST /internal/replay`
#[derive(Debug, Default, Deserialize)]
pub struct ReplayBody {
    /// Checkpoint file; empty replays from the start of the log
    #[serde(default)]
    pub file: String,
    /// Line offset within the checkpoint file
    #[serde(default)]
    pub line: u64,
}

/// Handler for `POST /internal/replay`
pub async fn replay(
    State(state): State<AppState>,
    Json(body): Json<ReplayBody>,
) -> impl IntoResponse {
    let position = LogPosition {
        file: body.file,
        line: body.line,
    };

    match state.replayer.replay_from(&position).await {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) => {
            tracing::error!("Replay failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "replay_failed"})),
            )
        }
    }
}

/// Handler for `GET /internal/incident`
///
/// Captures a support bundle: the full telemetry snapshot, the tail of
/// the durable log and worker-pool state, in one response.
pub async fn incident(State(state): State<AppState>) -> impl IntoResponse {
    let telemetry = crate::telemetry::snapshot(&state.handles).await;

    let next_seq = state.handles.bus.next_seq();
    let recent_events = state
        .handles
        .bus
        .log()
        .read_range(next_seq.saturating_sub(100), u64::MAX)
        .unwrap_or_default();

    let worker_stats = state.handles.workers.stats();

    Json(json!({
        "captured_ts": chrono::Utc::now().to_rfc3339(),
        "telemetry": telemetry,
        "recent_events": recent_events,
        "workers": {
            "executed": worker_stats.executed,
            "failed": worker_stats.failed,
            "deadlettered": worker_stats.deadlettered,
            "fallback_sync": worker_stats.fallback_sync,
            "queue_depth": worker_stats.queue_depth,
        },
    }))
}

/// Handler for `GET /internal/preflight`
///
/// Verifies the route table contract: `/chat` is critical, the
/// observability routes must answer even when dependencies are down.
pub async fn preflight(State(state): State<AppState>) -> impl IntoResponse {
    let health = crate::telemetry::health(&state.handles).await;

    Json(json!({
        "routes": [
            {"route": "/chat", "criticality": "critical"},
            {"route": "/health", "criticality": "observability"},
            {"route": "/telemetry", "criticality": "observability"},
            {"route": "/metrics", "criticality": "observability"},
            {"route": "/v1/ws", "criticality": "observability"},
            {"route": "/v1/events", "criticality": "observability"},
        ],
        "health": health,
        "providers": state.handles.router.provider_ids(),
    }))
}
