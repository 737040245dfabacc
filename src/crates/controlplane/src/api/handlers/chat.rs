//! The `/chat` handler
//!
//! Thin mapping from the pipeline outcome to HTTP: 200 for usable
//! responses (including degraded ones, which carry a safe reason), 429
//! with a retry hint when rate limited, 403 when blocked, 408 when the
//! deadline killed the request and 503 when nothing could answer. A
//! merely degraded dependency never becomes a 5xx.

use crate::api::routes::AppState;
use crate::error::FaultKind;
use crate::pipeline::{ChatStatus, ChatTurn};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Request body for `POST /chat`
#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    /// User message
    pub message: String,
    /// Caller identity
    pub user_id: String,
    /// Existing conversation, if any
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Response body for `POST /chat`
#[derive(Debug, Serialize)]
pub struct ChatResponseBody {
    /// Terminal status of the turn
    pub status: &'static str,
    /// Assistant response, when one was produced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Safe reason for non-ok outcomes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Retry hint for rate-limited callers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Run id of this turn
    pub run_id: String,
    /// Trace id of this turn
    pub trace_id: String,
    /// Conversation id
    pub conversation_id: String,
    /// Provider that answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picked_provider: Option<String>,
    /// Fallback attempts taken
    pub fallbacks_count: usize,
    /// Wall time of the turn
    pub latency_ms: u64,
}

/// Handler for `POST /chat`
pub async fn chat(State(state): State<AppState>, Json(body): Json<ChatRequestBody>) -> Response {
    let outcome = state
        .pipeline
        .handle(ChatTurn {
            message: body.message,
            user_id: body.user_id,
            conversation_id: body.conversation_id,
        })
        .await;

    state
        .handles
        .registry
        .record_request(outcome.latency_ms, outcome.status);

    let status_code = match outcome.status {
        ChatStatus::Ok | ChatStatus::Degraded => StatusCode::OK,
        ChatStatus::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ChatStatus::Blocked => StatusCode::FORBIDDEN,
        ChatStatus::Failed => {
            let timed_out = outcome
                .fault
                .as_ref()
                .map(|f| f.kind == FaultKind::Timeout)
                .unwrap_or(false);
            if timed_out {
                StatusCode::REQUEST_TIMEOUT
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    };

    let retry_after = outcome.retry_after_secs;
    let payload = ChatResponseBody {
        status: outcome.status.as_str(),
        response: outcome.text,
        reason: outcome.reason_safe,
        retry_after_secs: retry_after,
        run_id: outcome.run_id,
        trace_id: outcome.trace_id,
        conversation_id: outcome.conversation_id,
        picked_provider: outcome.picked_provider,
        fallbacks_count: outcome.fallbacks_count,
        latency_ms: outcome.latency_ms,
    };

    let mut response = (status_code, Json(payload)).into_response();
    if let Some(secs) = retry_after {
        if let Ok(value) = secs.to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}
