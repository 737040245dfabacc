//! Request handlers

mod chat;
mod internal;
mod observability;
mod voice;

pub use chat::chat;
pub use internal::{incident, preflight, replay, set_flag};
pub use observability::{events_window, health, metrics, telemetry};
pub use voice::{voice_asr, voice_session, voice_tts};
