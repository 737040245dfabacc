//! Deterministic local provider
//!
//! A dependency-free responder that always succeeds. It sits at the end of
//! every fallback chain so the control plane can return an answer even when
//! every remote provider is down.

use crate::error::Result;
use crate::provider::{ChatProvider, ChunkStream};
use crate::types::{ChatRequest, MessageChunk, MessageRole, ProviderKind, ProviderProfile};
use async_trait::async_trait;

/// Default id of the local provider
pub const LOCAL_PROVIDER_ID: &str = "local-fallback";

const TEMPLATES: [&str; 3] = [
    "I can take that on. Here is what I can do right now: {input}. \
     Some of my usual capabilities are reduced at the moment, so this answer \
     is intentionally brief.",
    "Thanks for the message. I noted: {input}. I am operating in a reduced \
     mode right now and will keep this response short.",
    "Understood: {input}. My richer reasoning backends are unreachable, so \
     this is a best-effort reply.",
];

/// Deterministic template responder
pub struct DeterministicProvider {
    id: String,
}

impl DeterministicProvider {
    /// Create the provider with the default id
    pub fn new() -> Self {
        Self {
            id: LOCAL_PROVIDER_ID.to_string(),
        }
    }

    /// Create the provider with a custom id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    fn render(&self, request: &ChatRequest) -> String {
        let input = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");

        // Template choice is a stable function of the input, so replays
        // produce identical output.
        let index = input.len() % TEMPLATES.len();
        let summary: String = input.chars().take(120).collect();
        TEMPLATES[index].replace("{input}", summary.trim())
    }
}

impl Default for DeterministicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for DeterministicProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            id: self.id.clone(),
            kind: ProviderKind::Chat,
            cost_units: 0.0,
            max_context: usize::MAX,
        }
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream> {
        let text = self.render(&request);
        let words: Vec<String> = text
            .split_inclusive(' ')
            .map(|w| w.to_string())
            .collect();
        let total = words.len();

        let stream = futures::stream::iter(words.into_iter().enumerate().map(move |(i, word)| {
            let chunk = MessageChunk::new(word);
            Ok(if i + 1 == total { chunk.final_chunk() } else { chunk })
        }));

        Ok(Box::pin(stream))
    }
}
