//! Inference provider implementations for synapse
//!
//! Concrete implementations of the [`ChatProvider`] trait the router
//! cascades over:
//!
//! - [`remote::HttpChatProvider`] - OpenAI-compatible chat-completions API
//!   with server-sent-event streaming
//! - [`local::DeterministicProvider`] - dependency-free template responder,
//!   the terminal candidate of every fallback chain
//!
//! Each provider streams [`MessageChunk`]s; per-provider rolling metrics
//! live in [`metrics`] and feed router scoring.

pub mod error;
pub mod local;
pub mod metrics;
pub mod provider;
pub mod remote;
pub mod types;

pub use error::{LlmError, Result};
pub use local::DeterministicProvider;
pub use metrics::{MetricsSnapshot, ProviderMetrics};
pub use provider::{ChatProvider, ChunkStream};
pub use remote::HttpChatProvider;
pub use types::{ChatMessage, ChatRequest, MessageChunk, MessageRole, ProviderKind, ProviderProfile};
