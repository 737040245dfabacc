//! The `event_v1` envelope
//!
//! Every event carries a globally unique id, a process-monotonic sequence
//! number, a UTC timestamp, a dotted kind, a trace id and a redacted
//! payload. Events are immutable once published.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current envelope schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Dotted event kind namespace.
///
/// Known kinds are first-class variants; anything else parses into
/// `Other` and is only counted, never rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// An inbound chat turn was handled
    ChatMessage,
    /// A chat request was rejected by the rate limiter
    ChatRateLimited,
    /// A pipeline stage finished
    RunStep,
    /// A provider served (or failed to serve) a request
    ProviderUsed,
    /// A control-room task was created
    TaskCreated,
    /// A control-room task changed state
    TaskUpdated,
    /// A background task failed terminally
    TaskFailed,
    /// The policy engine asked for a human approval
    ApprovalRequested,
    /// A pending approval was resolved
    ApprovalResolved,
    /// A tool action was executed within a step
    ActionExecuted,
    /// A step produced an artifact
    ArtifactProduced,
    /// An external source was sighted
    SourceSeen,
    /// A feature flag changed
    FeatureFlagUpdated,
    /// A component reported itself alive
    ComponentSeen,
    /// A worker heartbeat
    WorkerSeen,
    /// Work was executed inline because the broker was unreachable
    AsyncFallbackSync,
    /// A voice session started
    VoiceSessionStarted,
    /// A final speech-recognition transcript is available
    VoiceAsrFinal,
    /// Synthesized audio is ready
    VoiceTtsAudioReady,
    /// The voice bridge reported an error
    VoiceError,
    /// Any kind this build does not know about
    Other(String),
}

impl EventKind {
    /// Dotted wire name of this kind
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::ChatMessage => "chat.message",
            EventKind::ChatRateLimited => "chat.rate_limited",
            EventKind::RunStep => "run.step",
            EventKind::ProviderUsed => "provider.used",
            EventKind::TaskCreated => "control_room.task.created",
            EventKind::TaskUpdated => "control_room.task.updated",
            EventKind::TaskFailed => "task.failed",
            EventKind::ApprovalRequested => "control_room.approval.requested",
            EventKind::ApprovalResolved => "control_room.approval.resolved",
            EventKind::ActionExecuted => "action.executed",
            EventKind::ArtifactProduced => "artifact.produced",
            EventKind::SourceSeen => "source.seen",
            EventKind::FeatureFlagUpdated => "feature_flag.updated",
            EventKind::ComponentSeen => "component.seen",
            EventKind::WorkerSeen => "worker.seen",
            EventKind::AsyncFallbackSync => "async.fallback_sync",
            EventKind::VoiceSessionStarted => "voice.session.started",
            EventKind::VoiceAsrFinal => "voice.asr.final",
            EventKind::VoiceTtsAudioReady => "voice.tts.audio.ready",
            EventKind::VoiceError => "voice.error",
            EventKind::Other(s) => s,
        }
    }

    /// Whether this kind is unknown to this build
    pub fn is_other(&self) -> bool {
        matches!(self, EventKind::Other(_))
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "chat.message" => EventKind::ChatMessage,
            "chat.rate_limited" => EventKind::ChatRateLimited,
            "run.step" => EventKind::RunStep,
            "provider.used" => EventKind::ProviderUsed,
            "control_room.task.created" => EventKind::TaskCreated,
            "control_room.task.updated" => EventKind::TaskUpdated,
            "task.failed" => EventKind::TaskFailed,
            "control_room.approval.requested" => EventKind::ApprovalRequested,
            "control_room.approval.resolved" => EventKind::ApprovalResolved,
            "action.executed" => EventKind::ActionExecuted,
            "artifact.produced" => EventKind::ArtifactProduced,
            "source.seen" => EventKind::SourceSeen,
            "feature_flag.updated" => EventKind::FeatureFlagUpdated,
            "component.seen" => EventKind::ComponentSeen,
            "worker.seen" => EventKind::WorkerSeen,
            "async.fallback_sync" => EventKind::AsyncFallbackSync,
            "voice.session.started" => EventKind::VoiceSessionStarted,
            "voice.asr.final" => EventKind::VoiceAsrFinal,
            "voice.tts.audio.ready" => EventKind::VoiceTtsAudioReady,
            "voice.error" => EventKind::VoiceError,
            _ => EventKind::Other(s),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A published `event_v1` envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event id
    pub event_id: Uuid,
    /// Process-monotonic sequence number
    pub seq: u64,
    /// Publish timestamp, UTC
    pub ts: DateTime<Utc>,
    /// Dotted event kind
    pub kind: EventKind,
    /// Envelope schema version
    pub schema_version: u32,
    /// Conversation this event belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Trace correlating all events of one request
    pub trace_id: String,
    /// Redacted payload
    pub payload: Value,
}

/// An event under construction, before the bus stamps it.
///
/// The bus assigns `event_id` (when absent), `seq` and `ts`, and redacts
/// the payload on publish.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// Event kind
    pub kind: EventKind,
    /// Pre-assigned event id, if the producer has one
    pub event_id: Option<Uuid>,
    /// Conversation id, if any
    pub conversation_id: Option<String>,
    /// Trace id; generated when absent
    pub trace_id: Option<String>,
    /// Unredacted payload
    pub payload: Value,
}

impl EventDraft {
    /// Start a draft of the given kind with an empty payload
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            event_id: None,
            conversation_id: None,
            trace_id: None,
            payload: Value::Object(Default::default()),
        }
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the conversation id
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Set the trace id
    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Pin the event id (used by replay, which must keep ids stable)
    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }
}
