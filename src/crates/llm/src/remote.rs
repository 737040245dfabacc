//! OpenAI-compatible remote provider
//!
//! Streams chat completions over the `/chat/completions` server-sent-event
//! protocol. Any endpoint speaking that dialect (OpenAI, OpenRouter, local
//! inference servers) can back this provider.

use crate::error::{LlmError, Result};
use crate::provider::{ChatProvider, ChunkStream};
use crate::types::{ChatMessage, ChatRequest, MessageChunk, MessageRole, ProviderKind, ProviderProfile};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for an OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct RemoteProviderConfig {
    /// Provider id as it appears in the graph
    pub id: String,
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    /// Bearer token, when the endpoint requires one
    pub api_key: Option<String>,
    /// Model name sent with every request
    pub model: String,
    /// Relative cost per call
    pub cost_units: f64,
    /// Largest accepted context in estimated tokens
    pub max_context: usize,
    /// HTTP client timeout
    pub timeout: Duration,
}

impl RemoteProviderConfig {
    /// Minimal config for an endpoint
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            cost_units: 1.0,
            max_context: 128_000,
            timeout: Duration::from_secs(60),
        }
    }

    /// Set the bearer token
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the relative cost
    pub fn with_cost_units(mut self, cost_units: f64) -> Self {
        self.cost_units = cost_units;
        self
    }

    /// Set the context cap
    pub fn with_max_context(mut self, max_context: usize) -> Self {
        self.max_context = max_context;
        self
    }
}

/// OpenAI-compatible chat provider
pub struct HttpChatProvider {
    config: RemoteProviderConfig,
    client: Client,
}

impl HttpChatProvider {
    /// Create a provider from a config.
    pub fn new(config: RemoteProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn convert_message(message: &ChatMessage) -> WireMessage {
        WireMessage {
            role: match message.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            }
            .to_string(),
            content: message.content.clone(),
        }
    }
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            id: self.config.id.clone(),
            kind: ProviderKind::Chat,
            cost_units: self.config.cost_units,
            max_context: self.config.max_context,
        }
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = WireRequest {
            model: self.config.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
        };

        let mut http = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(LlmError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: format!("chat completion rejected by {}", self.config.id),
            });
        }

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            let mut finished = false;

            while let Some(part) = bytes.next().await {
                let part = part.map_err(|e| LlmError::MalformedStream(e.to_string()))?;
                buffer.push_str(&String::from_utf8_lossy(&part));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();

                    if data == "[DONE]" {
                        finished = true;
                        yield MessageChunk::new("").final_chunk();
                        continue;
                    }

                    let frame: WireStreamFrame = serde_json::from_str(data)
                        .map_err(|e| LlmError::MalformedStream(e.to_string()))?;
                    if let Some(choice) = frame.choices.into_iter().next() {
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty() {
                                yield MessageChunk::new(content);
                            }
                        }
                    }
                }
            }

            if !finished {
                let truncated: Result<MessageChunk> = Err(LlmError::MalformedStream(
                    "stream ended without a terminal frame".to_string(),
                ));
                truncated?;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> bool {
        let url = format!("{}/models", self.config.base_url);
        let mut http = self.client.get(&url).timeout(Duration::from_millis(500));
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key);
        }
        matches!(http.send().await, Ok(resp) if resp.status().is_success())
    }
}

// Wire types for the chat-completions dialect

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireStreamFrame {
    choices: Vec<WireStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: WireDelta,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_from_config() {
        let provider = HttpChatProvider::new(
            RemoteProviderConfig::new("openai", "https://api.openai.com/v1", "gpt-4o")
                .with_cost_units(3.0)
                .with_max_context(128_000),
        )
        .unwrap();

        let profile = provider.profile();
        assert_eq!(profile.id, "openai");
        assert_eq!(profile.cost_units, 3.0);
        assert_eq!(profile.max_context, 128_000);
    }

    #[test]
    fn test_message_conversion() {
        let wire = HttpChatProvider::convert_message(&ChatMessage::system("be brief"));
        assert_eq!(wire.role, "system");
        assert_eq!(wire.content, "be brief");
    }

    #[test]
    fn test_stream_frame_parsing() {
        let frame: WireStreamFrame = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"hel"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(frame.choices[0].delta.content.as_deref(), Some("hel"));

        let empty: WireStreamFrame =
            serde_json::from_str(r#"{"choices":[{"delta":{}}]}"#).unwrap();
        assert_eq!(empty.choices[0].delta.content, None);
    }

    #[test]
    fn test_request_serialization_skips_absent_fields() {
        let body = WireRequest {
            model: "m".to_string(),
            messages: vec![],
            temperature: None,
            max_tokens: None,
            stream: true,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("temperature"));
        assert!(!json.contains("max_tokens"));
        assert!(json.contains("\"stream\":true"));
    }
}
