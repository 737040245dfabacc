//! Request, message and chunk types shared by all providers

use serde::{Deserialize, Serialize};

/// What a provider serves
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderKind {
    /// Chat completion
    Chat,
    /// Web scraping
    Scraper,
    /// Text to speech
    Tts,
    /// Speech to text
    Stt,
    /// Anything else
    Other(String),
}

impl ProviderKind {
    /// Stable wire name
    pub fn as_str(&self) -> &str {
        match self {
            ProviderKind::Chat => "chat",
            ProviderKind::Scraper => "scraper",
            ProviderKind::Tts => "tts",
            ProviderKind::Stt => "stt",
            ProviderKind::Other(s) => s,
        }
    }
}

impl From<String> for ProviderKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "chat" => ProviderKind::Chat,
            "scraper" => ProviderKind::Scraper,
            "tts" => ProviderKind::Tts,
            "stt" => ProviderKind::Stt,
            _ => ProviderKind::Other(s),
        }
    }
}

impl From<ProviderKind> for String {
    fn from(kind: ProviderKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Static description of a provider, used for scoring
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    /// Unique provider id
    pub id: String,
    /// What this provider serves
    pub kind: ProviderKind,
    /// Relative cost per call in abstract units
    pub cost_units: f64,
    /// Largest context (in estimated tokens) this provider accepts
    pub max_context: usize,
}

impl ProviderProfile {
    /// Create a chat provider profile
    pub fn chat(id: impl Into<String>, cost_units: f64, max_context: usize) -> Self {
        Self {
            id: id.into(),
            kind: ProviderKind::Chat,
            cost_units,
            max_context,
        }
    }
}

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction
    System,
    /// End-user turn
    User,
    /// Assistant turn
    Assistant,
}

/// One chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role
    pub role: MessageRole,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// System message
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into() }
    }

    /// User message
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }

    /// Assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into() }
    }
}

/// A chat completion request
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Conversation so far
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Output token cap
    pub max_tokens: Option<usize>,
}

impl ChatRequest {
    /// Create a request from messages
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set the sampling temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the output token cap
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Rough context size estimate in tokens (four bytes per token)
    pub fn estimated_context(&self) -> usize {
        let bytes: usize = self.messages.iter().map(|m| m.content.len()).sum();
        bytes / 4 + self.messages.len()
    }
}

/// A chunk of a streaming completion
#[derive(Debug, Clone)]
pub struct MessageChunk {
    /// The content delta
    pub content: String,
    /// Whether this is the final chunk
    pub is_final: bool,
}

impl MessageChunk {
    /// A content chunk
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: false,
        }
    }

    /// Mark as the final chunk
    pub fn final_chunk(mut self) -> Self {
        self.is_final = true;
        self
    }
}
