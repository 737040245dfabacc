//! Voice collaborator surface
//!
//! The transport bridge lives outside the core; these endpoints only
//! accept its notifications and turn them into `voice.*` events. No raw
//! audio or transcript text enters the log or the graph, only hashes and
//! ids.

use crate::api::routes::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use events::{EventDraft, EventKind};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// Body for `POST /v1/voice/session`
#[derive(Debug, Deserialize)]
pub struct VoiceSessionBody {
    /// Conversation to attach the session to
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Body for `POST /v1/voice/asr`
#[derive(Debug, Deserialize)]
pub struct VoiceAsrBody {
    /// Voice session id
    pub session_id: String,
    /// SHA-256 of the final transcript
    pub transcript_hash: String,
    /// Transcript length in characters
    #[serde(default)]
    pub transcript_len: u64,
    /// Conversation, if known
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Body for `POST /v1/voice/tts`
#[derive(Debug, Deserialize)]
pub struct VoiceTtsBody {
    /// Voice session id
    pub session_id: String,
    /// SHA-256 of the produced audio
    pub audio_hash: String,
    /// Audio duration in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
    /// Conversation, if known
    #[serde(default)]
    pub conversation_id: Option<String>,
}

fn accepted(event: events::Event) -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        Json(json!({"event_id": event.event_id, "seq": event.seq})),
    )
}

/// Handler for `POST /v1/voice/session`
pub async fn voice_session(
    State(state): State<AppState>,
    Json(body): Json<VoiceSessionBody>,
) -> impl IntoResponse {
    let session_id = Uuid::new_v4().to_string();
    let mut draft = EventDraft::new(EventKind::VoiceSessionStarted)
        .with_payload(json!({"session_id": session_id}));
    if let Some(conversation_id) = body.conversation_id {
        draft = draft.with_conversation(conversation_id);
    }

    let event = state.handles.bus.publish(draft);
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "event_id": event.event_id,
            "seq": event.seq,
            "session_id": session_id,
        })),
    )
}

/// Handler for `POST /v1/voice/asr`
pub async fn voice_asr(
    State(state): State<AppState>,
    Json(body): Json<VoiceAsrBody>,
) -> impl IntoResponse {
    let mut draft = EventDraft::new(EventKind::VoiceAsrFinal).with_payload(json!({
        "session_id": body.session_id,
        "transcript_hash": body.transcript_hash,
        "transcript_len": body.transcript_len,
    }));
    if let Some(conversation_id) = body.conversation_id {
        draft = draft.with_conversation(conversation_id);
    }
    accepted(state.handles.bus.publish(draft))
}

/// Handler for `POST /v1/voice/tts`
pub async fn voice_tts(
    State(state): State<AppState>,
    Json(body): Json<VoiceTtsBody>,
) -> impl IntoResponse {
    let mut draft = EventDraft::new(EventKind::VoiceTtsAudioReady).with_payload(json!({
        "session_id": body.session_id,
        "audio_hash": body.audio_hash,
        "duration_ms": body.duration_ms,
    }));
    if let Some(conversation_id) = body.conversation_id {
        draft = draft.with_conversation(conversation_id);
    }
    accepted(state.handles.bus.publish(draft))
}
