//! Intent classification
//!
//! Two stages: fast deterministic keyword matching, then optional LLM
//! refinement through the router for low-confidence inputs. Confidence is
//! banded, and the bands gate what the policy engine will allow.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Confidence at or above which mutating tools are allowed
pub const HIGH_CONFIDENCE: f64 = 0.85;

/// Confidence at or above which read-only tools are allowed
pub const MEDIUM_CONFIDENCE: f64 = 0.72;

/// What the user is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// Greeting or chit-chat
    SmallTalk,
    /// Informational question
    Question,
    /// Read-only tool use
    ToolRead,
    /// Mutating tool use
    ToolMutate,
    /// Code or command execution
    CodeExec,
    /// Could not tell
    Unknown,
}

impl IntentKind {
    /// Stable name for events and telemetry
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::SmallTalk => "small_talk",
            IntentKind::Question => "question",
            IntentKind::ToolRead => "tool_read",
            IntentKind::ToolMutate => "tool_mutate",
            IntentKind::CodeExec => "code_exec",
            IntentKind::Unknown => "unknown",
        }
    }
}

/// Which stage produced the classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierStage {
    /// Keyword heuristics
    Heuristic,
    /// LLM refinement
    Refined,
}

/// A classified intent
#[derive(Debug, Clone, Copy)]
pub struct Intent {
    /// What the user wants
    pub kind: IntentKind,
    /// Classifier confidence in [0, 1]
    pub confidence: f64,
    /// Producing stage
    pub stage: ClassifierStage,
}

/// Confidence band gating tool access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    /// Mutating tools allowed
    High,
    /// Read-only tools allowed
    Medium,
    /// Only a clarifying question may be returned
    Low,
}

impl ConfidenceBand {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBand::High => "high",
            ConfidenceBand::Medium => "medium",
            ConfidenceBand::Low => "low",
        }
    }
}

/// Band a confidence value.
pub fn band(confidence: f64) -> ConfidenceBand {
    if confidence >= HIGH_CONFIDENCE {
        ConfidenceBand::High
    } else if confidence >= MEDIUM_CONFIDENCE {
        ConfidenceBand::Medium
    } else {
        ConfidenceBand::Low
    }
}

/// Keyword-first intent classifier
pub struct IntentClassifier {
    greeting: Regex,
    exec: Regex,
    mutate: Regex,
    read: Regex,
    question: Regex,
}

impl IntentClassifier {
    /// Compile the keyword patterns.
    pub fn new() -> Self {
        Self {
            greeting: Regex::new(r"(?i)^\s*(hi|hello|hey|good (morning|afternoon|evening)|thanks|thank you)\b")
                .expect("static regex"),
            exec: Regex::new(r"(?i)\b(run|execute|exec|shell|terminal|command)\b").expect("static regex"),
            mutate: Regex::new(r"(?i)\b(delete|remove|update|write|create|deploy|modify|rename|move|install)\b")
                .expect("static regex"),
            read: Regex::new(r"(?i)\b(show|list|read|fetch|look up|display|status of|check)\b")
                .expect("static regex"),
            question: Regex::new(r"(?i)^(what|why|how|when|where|who|which|can|could|is|are|does|do)\b")
                .expect("static regex"),
        }
    }

    /// Stage one: deterministic keyword classification.
    pub fn classify(&self, message: &str) -> Intent {
        let (kind, confidence) = if self.greeting.is_match(message) {
            (IntentKind::SmallTalk, 0.95)
        } else if self.exec.is_match(message) {
            (IntentKind::CodeExec, 0.90)
        } else if self.mutate.is_match(message) {
            (IntentKind::ToolMutate, 0.88)
        } else if self.read.is_match(message) {
            (IntentKind::ToolRead, 0.86)
        } else if message.trim_end().ends_with('?') || self.question.is_match(message) {
            (IntentKind::Question, 0.80)
        } else {
            (IntentKind::Unknown, 0.50)
        };

        Intent {
            kind,
            confidence,
            stage: ClassifierStage::Heuristic,
        }
    }

    /// Prompt sent through the router for stage-two refinement.
    pub fn refinement_prompt(&self, message: &str) -> String {
        format!(
            "Classify the user message into exactly one of: small_talk, question, \
             tool_read, tool_mutate, code_exec. Respond with only the label.\n\n\
             Message: {}",
            message
        )
    }

    /// Parse a refinement answer; unknown labels are rejected.
    pub fn parse_refinement(&self, response: &str) -> Option<IntentKind> {
        match response.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "small_talk" => Some(IntentKind::SmallTalk),
            "question" => Some(IntentKind::Question),
            "tool_read" => Some(IntentKind::ToolRead),
            "tool_mutate" => Some(IntentKind::ToolMutate),
            "code_exec" => Some(IntentKind::CodeExec),
            _ => None,
        }
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}
