//! Policy gate
//!
//! An opaque decision function over a registry of seeded policies. The
//! core consumes decisions; policy semantics beyond the gate live outside
//! it. Denials carry only a safe reason, never policy internals.

use crate::intent::{ConfidenceBand, IntentKind};
use serde::{Deserialize, Serialize};

/// Requests touching code execution need an approval
pub const POLICY_SAFETY_CODE_EXEC: &str = "safety_code_exec_v1";
/// Very large mutating requests need an approval
pub const POLICY_NO_BIG_DIFF: &str = "no_big_diff_v1";
/// Prefer reusing existing artifacts over producing new ones
pub const POLICY_REUSE_FIRST: &str = "reuse_first_v1";
/// Mutations must pass the test gate
pub const POLICY_TEST_GATE: &str = "test_gate_v1";

/// Mutating request size above which `no_big_diff_v1` applies (bytes)
const BIG_REQUEST_BYTES: usize = 8_192;

/// What the policy engine decided
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Proceed
    Allow,
    /// Reject with a safe reason
    Deny {
        /// Reason safe to show the caller
        reason_safe: String,
    },
    /// Park the request behind a human approval
    NeedsApproval {
        /// Policy that asked for the approval
        policy_id: String,
        /// Reason safe to show the caller
        reason_safe: String,
    },
}

/// Inputs the gate evaluates
#[derive(Debug, Clone)]
pub struct PolicyRequest {
    /// Classified intent
    pub intent: IntentKind,
    /// Confidence band of the classification
    pub band: ConfidenceBand,
    /// Size of the inbound message in bytes
    pub message_bytes: usize,
}

/// Opaque policy engine over a seeded registry
pub struct PolicyEngine {
    registry: Vec<String>,
}

impl PolicyEngine {
    /// Create the engine with the standard policy registry.
    pub fn new() -> Self {
        Self {
            registry: vec![
                POLICY_SAFETY_CODE_EXEC.to_string(),
                POLICY_NO_BIG_DIFF.to_string(),
                POLICY_REUSE_FIRST.to_string(),
                POLICY_TEST_GATE.to_string(),
            ],
        }
    }

    /// Registered policy ids.
    pub fn registry(&self) -> &[String] {
        &self.registry
    }

    /// Evaluate a request.
    ///
    /// Banding is part of the gate: mutating intents below the high band
    /// are denied, and code execution always requires an approval.
    pub fn evaluate(&self, request: &PolicyRequest) -> Decision {
        if request.intent == IntentKind::CodeExec {
            return Decision::NeedsApproval {
                policy_id: POLICY_SAFETY_CODE_EXEC.to_string(),
                reason_safe: "code execution requires an approval".to_string(),
            };
        }

        if request.intent == IntentKind::ToolMutate {
            if request.band != ConfidenceBand::High {
                return Decision::Deny {
                    reason_safe: "confidence too low for mutating tools".to_string(),
                };
            }
            if request.message_bytes > BIG_REQUEST_BYTES {
                return Decision::NeedsApproval {
                    policy_id: POLICY_NO_BIG_DIFF.to_string(),
                    reason_safe: "large change requires an approval".to_string(),
                };
            }
        }

        if request.intent == IntentKind::ToolRead && request.band == ConfidenceBand::Low {
            return Decision::Deny {
                reason_safe: "confidence too low for tool use".to_string(),
            };
        }

        Decision::Allow
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(intent: IntentKind, band: ConfidenceBand) -> PolicyRequest {
        PolicyRequest {
            intent,
            band,
            message_bytes: 64,
        }
    }

    #[test]
    fn test_small_talk_allowed() {
        let engine = PolicyEngine::new();
        assert_eq!(
            engine.evaluate(&request(IntentKind::SmallTalk, ConfidenceBand::High)),
            Decision::Allow
        );
    }

    #[test]
    fn test_code_exec_needs_approval() {
        let engine = PolicyEngine::new();
        match engine.evaluate(&request(IntentKind::CodeExec, ConfidenceBand::High)) {
            Decision::NeedsApproval { policy_id, .. } => {
                assert_eq!(policy_id, POLICY_SAFETY_CODE_EXEC);
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_mutate_denied_below_high_band() {
        let engine = PolicyEngine::new();
        match engine.evaluate(&request(IntentKind::ToolMutate, ConfidenceBand::Medium)) {
            Decision::Deny { reason_safe } => {
                assert!(reason_safe.contains("confidence"));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_mutate_allowed_at_high_band() {
        let engine = PolicyEngine::new();
        assert_eq!(
            engine.evaluate(&request(IntentKind::ToolMutate, ConfidenceBand::High)),
            Decision::Allow
        );
    }

    #[test]
    fn test_big_mutation_needs_approval() {
        let engine = PolicyEngine::new();
        let decision = engine.evaluate(&PolicyRequest {
            intent: IntentKind::ToolMutate,
            band: ConfidenceBand::High,
            message_bytes: BIG_REQUEST_BYTES + 1,
        });
        match decision {
            Decision::NeedsApproval { policy_id, .. } => {
                assert_eq!(policy_id, POLICY_NO_BIG_DIFF);
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_registry_contains_seeded_policies() {
        let engine = PolicyEngine::new();
        assert_eq!(engine.registry().len(), 4);
        assert!(engine.registry().iter().any(|p| p == POLICY_TEST_GATE));
        assert!(engine.registry().iter().any(|p| p == POLICY_REUSE_FIRST));
    }
}
