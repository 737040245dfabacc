//! Provider error types

use thiserror::Error;

/// Errors surfaced by provider calls
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network-level failure reaching the provider
    #[error("Provider transport error: {0}")]
    Transport(String),

    /// The provider did not answer within its deadline
    #[error("Provider timed out after {0} ms")]
    Timeout(u64),

    /// The provider returned an error status
    #[error("Provider API error (status {status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Safe, short description
        message: String,
    },

    /// The stream broke or produced undecodable frames
    #[error("Malformed provider stream: {0}")]
    MalformedStream(String),

    /// The request was cancelled by the caller
    #[error("Provider call cancelled")]
    Cancelled,
}

impl LlmError {
    /// Whether the next candidate in a fallback chain should be tried
    pub fn retryable(&self) -> bool {
        match self {
            LlmError::Transport(_) | LlmError::Timeout(_) | LlmError::MalformedStream(_) => true,
            LlmError::Api { status, .. } => *status >= 500 || *status == 429,
            LlmError::Cancelled => false,
        }
    }

    /// Short stable name for events and telemetry
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Transport(_) => "transport",
            LlmError::Timeout(_) => "timeout",
            LlmError::Api { .. } => "api",
            LlmError::MalformedStream(_) => "malformed_stream",
            LlmError::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(0)
        } else if let Some(status) = err.status() {
            LlmError::Api {
                status: status.as_u16(),
                message: "upstream error".to_string(),
            }
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, LlmError>;
