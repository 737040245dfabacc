//! Fault triple surfaced between subsystems
//!
//! Every I/O boundary reports failure as `{kind, message_safe, retryable}`.
//! The message is safe to show to a caller; internals stay in logs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Abstract fault classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Network-level failure reaching a dependency
    Transport,
    /// A deadline elapsed
    Timeout,
    /// The caller exceeded a rate limit
    RateLimited,
    /// The policy gate rejected the request
    PolicyBlock,
    /// A dependency is degraded but the request completed best-effort
    UpstreamDegraded,
    /// No handler exists for the input
    Unhandled,
    /// Redaction dropped or hashed content
    Integrity,
}

impl FaultKind {
    /// Stable name for events and telemetry
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Transport => "transport",
            FaultKind::Timeout => "timeout",
            FaultKind::RateLimited => "rate_limited",
            FaultKind::PolicyBlock => "policy_block",
            FaultKind::UpstreamDegraded => "upstream_degraded",
            FaultKind::Unhandled => "unhandled",
            FaultKind::Integrity => "integrity",
        }
    }
}

/// A compact fault surfaced upward by a subsystem
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message_safe}")]
pub struct Fault {
    /// What class of failure this is
    pub kind: FaultKind,
    /// Short description safe to expose to callers
    pub message_safe: String,
    /// Whether retrying later could succeed
    pub retryable: bool,
}

impl Fault {
    /// Create a fault
    pub fn new(kind: FaultKind, message_safe: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message_safe: message_safe.into(),
            retryable,
        }
    }

    /// Transport fault (retryable)
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Transport, message, true)
    }

    /// Timeout fault (retryable)
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, message, true)
    }

    /// Rate-limit fault
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FaultKind::RateLimited, message, true)
    }

    /// Policy block (not retryable)
    pub fn policy_block(message: impl Into<String>) -> Self {
        Self::new(FaultKind::PolicyBlock, message, false)
    }

    /// Upstream degraded
    pub fn upstream_degraded(message: impl Into<String>) -> Self {
        Self::new(FaultKind::UpstreamDegraded, message, true)
    }

    /// Classify a provider error kind string from the router.
    pub fn from_provider_error(error_kind: &str, message: impl Into<String>) -> Self {
        match error_kind {
            "timeout" | "cancelled" => Self::timeout(message),
            "transport" => Self::transport(message),
            _ => Self::upstream_degraded(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_retryable() {
        assert!(Fault::transport("down").retryable);
        assert!(Fault::timeout("slow").retryable);
        assert!(!Fault::policy_block("no").retryable);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(FaultKind::RateLimited.as_str(), "rate_limited");
        assert_eq!(FaultKind::UpstreamDegraded.as_str(), "upstream_degraded");
    }

    #[test]
    fn test_serializes_snake_case() {
        let fault = Fault::policy_block("denied");
        let json = serde_json::to_string(&fault).unwrap();
        assert!(json.contains("\"policy_block\""));
    }

    #[test]
    fn test_provider_error_classification() {
        assert_eq!(Fault::from_provider_error("timeout", "t").kind, FaultKind::Timeout);
        assert_eq!(Fault::from_provider_error("cancelled", "c").kind, FaultKind::Timeout);
        assert_eq!(Fault::from_provider_error("transport", "n").kind, FaultKind::Transport);
        assert_eq!(
            Fault::from_provider_error("api", "a").kind,
            FaultKind::UpstreamDegraded
        );
    }
}
