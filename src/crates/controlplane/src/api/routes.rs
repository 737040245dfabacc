//! API route definitions
//!
//! One critical route (`/chat`) and the observability surface. Shared
//! state travels by handle, never by ambient lookup.

use crate::api::{handlers, ws};
use crate::gml::Replayer;
use crate::pipeline::ChatPipeline;
use crate::telemetry::TelemetryHandles;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// The chat pipeline
    pub pipeline: Arc<ChatPipeline>,
    /// Handles for the observability endpoints
    pub handles: TelemetryHandles,
    /// Operator replay tool
    pub replayer: Arc<Replayer>,
}

/// Build the complete API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Critical path
        .route("/chat", post(handlers::chat))
        // Observability
        .route("/health", get(handlers::health))
        .route("/telemetry", get(handlers::telemetry))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/ws", get(ws::ws_handler))
        .route("/v1/events", get(handlers::events_window))
        // Voice collaborator surface
        .route("/v1/voice/session", post(handlers::voice_session))
        .route("/v1/voice/asr", post(handlers::voice_asr))
        .route("/v1/voice/tts", post(handlers::voice_tts))
        // Operator surface
        .route("/internal/flags", post(handlers::set_flag))
        .route("/internal/replay", post(handlers::replay))
        .route("/internal/preflight", get(handlers::preflight))
        .route("/internal/incident", get(handlers::incident))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
