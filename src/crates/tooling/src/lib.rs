//! Shared tooling for the synapse workspace.
//!
//! This crate provides the cross-cutting utilities the control plane is
//! built on:
//!
//! - `redact` - payload redaction and hashing at trust boundaries
//! - `retry` - retry policies with exponential backoff and jitter
//! - `breaker` - circuit breaker for flaky dependencies
//! - `timeout` - deadline wrappers for async operations
//! - `env` - typed environment variable loading
//! - `logging` - tracing subscriber initialization

pub mod breaker;
pub mod env;
pub mod logging;
pub mod redact;
pub mod retry;
pub mod timeout;

use thiserror::Error;

/// Errors that can occur in the tooling crate
#[derive(Debug, Error)]
pub enum ToolingError {
    /// General error with message
    #[error("Tooling error: {0}")]
    General(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for tooling operations
pub type Result<T> = std::result::Result<T, ToolingError>;
