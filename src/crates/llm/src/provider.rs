//! The `ChatProvider` trait

use crate::error::Result;
use crate::types::{ChatRequest, MessageChunk, ProviderProfile};
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

/// A stream of completion chunks.
///
/// Errors mid-stream mark the stream malformed; the router treats them as
/// a provider failure and cascades.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<MessageChunk>> + Send>>;

/// An opaque inference provider.
///
/// Implementations are cheap to clone behind an `Arc` and safe to call
/// concurrently; per-call deadlines are enforced by the router, not here.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Static profile used for candidate scoring
    fn profile(&self) -> ProviderProfile;

    /// Stream a completion for the request
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream>;

    /// Cheap reachability probe
    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::LlmError;
    use crate::types::ProviderKind;

    /// Provider that yields a fixed set of chunks, or fails up front.
    pub struct ScriptedProvider {
        pub id: String,
        pub chunks: Vec<String>,
        pub fail_with: Option<fn() -> LlmError>,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn profile(&self) -> ProviderProfile {
            ProviderProfile {
                id: self.id.clone(),
                kind: ProviderKind::Chat,
                cost_units: 1.0,
                max_context: 8192,
            }
        }

        async fn chat_stream(&self, _request: ChatRequest) -> Result<ChunkStream> {
            if let Some(fail) = self.fail_with {
                return Err(fail());
            }
            let chunks = self.chunks.clone();
            let total = chunks.len();
            let stream = futures::stream::iter(chunks.into_iter().enumerate().map(
                move |(i, content)| {
                    let chunk = MessageChunk::new(content);
                    Ok(if i + 1 == total { chunk.final_chunk() } else { chunk })
                },
            ));
            Ok(Box::pin(stream))
        }
    }
}
