//! Chat control plane pipeline
//!
//! The synchronous request path: rate check, intent classification, policy
//! gate, provider routing, response composition and fire-and-forget trace
//! emission. Terminal states are done, blocked, degraded and failed; a
//! merely degraded dependency never turns into an error for the caller.
//!
//! Every stage emits a `run.step` event with a strictly increasing order;
//! the materializer projects those into the Run and Step nodes of the
//! graph. Publishing is non-blocking, so tracing can never stall the
//! response.

use crate::config::AppConfig;
use crate::error::Fault;
use crate::flags::{FlagStore, FLAG_INTENT_REFINE_ENABLED, FLAG_ROUTER_ENABLED};
use crate::intent::{band, ConfidenceBand, Intent, IntentClassifier, IntentKind};
use crate::policy::{Decision, PolicyEngine, PolicyRequest};
use crate::ratelimit::RateLimiter;
use crate::router::InferenceRouter;
use events::{EventBus, EventDraft, EventKind};
use llm::{ChatMessage, ChatRequest};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tooling::redact::{derive_id, sha256_hex};
use uuid::Uuid;

/// Terminal status of one handled chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStatus {
    /// A normal response was produced
    Ok,
    /// A best-effort response was produced under degradation
    Degraded,
    /// The policy gate (or an approval requirement) blocked the request
    Blocked,
    /// The caller exceeded their rate limit
    RateLimited,
    /// No response could be produced
    Failed,
}

impl ChatStatus {
    /// Stable name for responses and telemetry
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatStatus::Ok => "ok",
            ChatStatus::Degraded => "degraded",
            ChatStatus::Blocked => "blocked",
            ChatStatus::RateLimited => "rate_limited",
            ChatStatus::Failed => "failed",
        }
    }
}

/// An inbound chat turn
#[derive(Debug, Clone)]
pub struct ChatTurn {
    /// User message text
    pub message: String,
    /// Caller identity for rate limiting
    pub user_id: String,
    /// Existing conversation, if any
    pub conversation_id: Option<String>,
}

/// The outcome handed back to the API layer
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Terminal status
    pub status: ChatStatus,
    /// Response text, when one was produced
    pub text: Option<String>,
    /// Safe reason for blocked, degraded and failed outcomes
    pub reason_safe: Option<String>,
    /// Retry hint for rate-limited outcomes
    pub retry_after_secs: Option<u64>,
    /// Run id of this turn
    pub run_id: String,
    /// Trace id of this turn
    pub trace_id: String,
    /// Conversation id (generated when the caller had none)
    pub conversation_id: String,
    /// Provider that answered
    pub picked_provider: Option<String>,
    /// Fallback attempts before the answer
    pub fallbacks_count: usize,
    /// Wall time for the whole turn
    pub latency_ms: u64,
    /// Classified intent
    pub intent: IntentKind,
    /// Compact fault for non-ok outcomes
    pub fault: Option<Fault>,
}

struct TurnContext {
    run_id: String,
    trace_id: String,
    conversation_id: String,
    started: Instant,
    next_order: u32,
}

/// The chat control plane
pub struct ChatPipeline {
    bus: Arc<EventBus>,
    limiter: Arc<RateLimiter>,
    classifier: IntentClassifier,
    policy: PolicyEngine,
    router: Arc<InferenceRouter>,
    flags: Arc<FlagStore>,
    config: AppConfig,
}

impl ChatPipeline {
    /// Wire the pipeline.
    pub fn new(
        bus: Arc<EventBus>,
        limiter: Arc<RateLimiter>,
        router: Arc<InferenceRouter>,
        flags: Arc<FlagStore>,
        config: AppConfig,
    ) -> Self {
        Self {
            bus,
            limiter,
            classifier: IntentClassifier::new(),
            policy: PolicyEngine::new(),
            router,
            flags,
            config,
        }
    }

    /// Handle one chat turn end to end.
    pub async fn handle(&self, turn: ChatTurn) -> ChatOutcome {
        let started = Instant::now();
        let deadline = started + self.config.request_deadline;
        let trace_id = Uuid::new_v4().to_string();
        let conversation_id = turn
            .conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let turn_id = Uuid::new_v4().to_string();
        let run_id = derive_id(&[&conversation_id, &turn_id]);

        let mut ctx = TurnContext {
            run_id: run_id.clone(),
            trace_id: trace_id.clone(),
            conversation_id: conversation_id.clone(),
            started,
            next_order: 0,
        };

        // RECEIVED: the run exists from here on.
        self.publish(
            &ctx,
            EventKind::ChatMessage,
            json!({
                "run_id": &ctx.run_id,
                "user_id": &turn.user_id,
                "message_bytes": turn.message.len(),
                "message_hash": sha256_hex(turn.message.as_bytes()),
            }),
        );

        // RATE_CHECK
        let stage_start = Instant::now();
        let decision = self.limiter.check(&turn.user_id, "/chat").await;
        if !decision.allowed {
            self.publish(
                &ctx,
                EventKind::ChatRateLimited,
                json!({
                    "run_id": &ctx.run_id,
                    "user_id": &turn.user_id,
                    "retry_after_secs": decision.retry_after_secs,
                }),
            );
            self.emit_step(
                &mut ctx,
                "rate_check",
                "failed",
                stage_start,
                json!({"reason": "rate_limited", "run_status": "degraded"}),
            );
            return self.outcome(&ctx, ChatStatus::RateLimited, None, IntentKind::Unknown)
                .with_reason("rate limit exceeded")
                .with_retry_after(decision.retry_after_secs)
                .with_fault(Fault::rate_limited("rate limit exceeded"));
        }
        self.emit_step(&mut ctx, "rate_check", "success", stage_start, json!({}));

        // INTENT_CLASSIFY
        let stage_start = Instant::now();
        let mut intent = self.classifier.classify(&turn.message);
        intent = self.maybe_refine(&ctx, &turn, intent, deadline).await;
        self.emit_step(
            &mut ctx,
            "intent_classify",
            "success",
            stage_start,
            json!({
                "intent": intent.kind.as_str(),
                "confidence": intent.confidence,
                "band": band(intent.confidence).as_str(),
            }),
        );

        // POLICY_GATE
        let stage_start = Instant::now();
        let confidence_band = band(intent.confidence);
        let policy_decision = self.policy.evaluate(&PolicyRequest {
            intent: intent.kind,
            band: confidence_band,
            message_bytes: turn.message.len(),
        });

        match policy_decision {
            Decision::Deny { reason_safe } => {
                self.emit_step(
                    &mut ctx,
                    "policy_gate",
                    "failed",
                    stage_start,
                    json!({"reason": &reason_safe, "run_status": "degraded"}),
                );
                return self
                    .outcome(&ctx, ChatStatus::Blocked, None, intent.kind)
                    .with_fault(Fault::policy_block(reason_safe.clone()))
                    .with_reason(reason_safe);
            }
            Decision::NeedsApproval {
                policy_id,
                reason_safe,
            } => {
                self.request_approval(&ctx, &turn, &policy_id, &reason_safe);
                self.emit_step(
                    &mut ctx,
                    "policy_gate",
                    "failed",
                    stage_start,
                    json!({
                        "reason": "approval_required",
                        "policy_id": policy_id,
                        "run_status": "degraded",
                    }),
                );
                return self
                    .outcome(&ctx, ChatStatus::Blocked, None, intent.kind)
                    .with_fault(Fault::policy_block(reason_safe.clone()))
                    .with_reason(format!("{} (approval requested)", reason_safe));
            }
            Decision::Allow => {
                self.emit_step(&mut ctx, "policy_gate", "success", stage_start, json!({}));
            }
        }

        // Low confidence: answer with a clarifying question, never tools.
        if confidence_band == ConfidenceBand::Low {
            let stage_start = Instant::now();
            let text = clarifying_question(&turn.message);
            self.emit_step(&mut ctx, "response_compose", "success", stage_start, json!({}));
            self.emit_final_step(&mut ctx, "ok", None, 0, json!({}));
            return self.outcome(&ctx, ChatStatus::Ok, Some(text), intent.kind);
        }

        // ROUTE and PROVIDER_STREAM
        let stage_start = Instant::now();
        let request = ChatRequest::new(vec![ChatMessage::user(turn.message.clone())]);
        let route = self
            .router
            .route(request, &ctx.trace_id, &ctx.run_id, &ctx.conversation_id, deadline)
            .await;

        let route_status = if route.text.is_empty() { "failed" } else { "success" };
        self.emit_step(
            &mut ctx,
            "route",
            route_status,
            stage_start,
            json!({
                "picked_provider": &route.picked_provider,
                "fallbacks_count": route.fallbacks_count(),
                "error_kind": &route.error_kind,
            }),
        );

        if route.text.is_empty() {
            self.emit_final_step(
                &mut ctx,
                "degraded",
                route.picked_provider.as_deref(),
                route.fallbacks_count(),
                json!({"reason": route.error_kind}),
            );
            let error_kind = route
                .error_kind
                .clone()
                .unwrap_or_else(|| "no provider available".to_string());
            return self
                .outcome(&ctx, ChatStatus::Failed, None, intent.kind)
                .with_fault(Fault::from_provider_error(&error_kind, error_kind.clone()))
                .with_reason(error_kind)
                .with_route(&route);
        }

        // RESPONSE_COMPOSE
        let stage_start = Instant::now();
        let status = if route.degraded {
            ChatStatus::Degraded
        } else {
            ChatStatus::Ok
        };
        self.emit_step(&mut ctx, "response_compose", "success", stage_start, json!({}));

        // TRACE_EMIT: publish-only, nothing here can block the response.
        self.emit_final_step(
            &mut ctx,
            if status == ChatStatus::Ok { "ok" } else { "degraded" },
            route.picked_provider.as_deref(),
            route.fallbacks_count(),
            json!({}),
        );

        let reason = route.error_kind.clone();
        let mut outcome = self
            .outcome(&ctx, status, Some(route.text.clone()), intent.kind)
            .with_route(&route);
        if status == ChatStatus::Degraded {
            if let Some(reason) = reason {
                outcome = outcome
                    .with_fault(Fault::upstream_degraded(reason.clone()))
                    .with_reason(format!("reduced service: {}", reason));
            }
        }
        outcome
    }

    /// Stage two of intent classification, behind flags and the canary.
    async fn maybe_refine(
        &self,
        ctx: &TurnContext,
        turn: &ChatTurn,
        intent: Intent,
        deadline: Instant,
    ) -> Intent {
        if band(intent.confidence) != ConfidenceBand::Low {
            return intent;
        }
        if !self.flags.bool_flag(FLAG_INTENT_REFINE_ENABLED, true)
            || !self.flags.bool_flag(FLAG_ROUTER_ENABLED, true)
        {
            return intent;
        }
        if !canary_admits(&ctx.trace_id, self.flags.canary_percent()) {
            return intent;
        }

        let budget = self
            .config
            .intent_budget
            .min(deadline.saturating_duration_since(Instant::now()));
        if budget.is_zero() {
            return intent;
        }

        let prompt = self.classifier.refinement_prompt(&turn.message);
        let request = ChatRequest::new(vec![ChatMessage::user(prompt)]).with_max_tokens(8);
        let refine_deadline = Instant::now() + budget;

        let outcome = self
            .router
            .route(request, &ctx.trace_id, &ctx.run_id, &ctx.conversation_id, refine_deadline)
            .await;

        match self.classifier.parse_refinement(&outcome.text) {
            Some(kind) => Intent {
                kind,
                confidence: 0.80,
                stage: crate::intent::ClassifierStage::Refined,
            },
            None => intent,
        }
    }

    /// Emit the task and approval pair for a needs-approval decision.
    fn request_approval(&self, ctx: &TurnContext, turn: &ChatTurn, policy_id: &str, reason_safe: &str) {
        let task_id = Uuid::new_v4().to_string();
        let approval_id = Uuid::new_v4().to_string();

        self.publish(
            ctx,
            EventKind::TaskCreated,
            json!({
                "task_id": &task_id,
                "run_id": &ctx.run_id,
                "status": "waiting_approval",
                "priority": "normal",
                "requester": &turn.user_id,
                "reason_safe": reason_safe,
                "payload_redacted_hash": sha256_hex(turn.message.as_bytes()),
            }),
        );
        self.publish(
            ctx,
            EventKind::ApprovalRequested,
            json!({
                "approval_id": &approval_id,
                "task_id": &task_id,
                "run_id": &ctx.run_id,
                "policy_id": policy_id,
                "scope": "run",
                "status": "pending",
            }),
        );
    }

    fn publish(&self, ctx: &TurnContext, kind: EventKind, payload: Value) {
        self.bus.publish(
            EventDraft::new(kind)
                .with_conversation(ctx.conversation_id.clone())
                .with_trace(ctx.trace_id.clone())
                .with_payload(payload),
        );
    }

    fn emit_step(
        &self,
        ctx: &mut TurnContext,
        name: &str,
        status: &str,
        stage_start: Instant,
        extra: Value,
    ) {
        ctx.next_order += 1;
        let mut payload = json!({
            "run_id": &ctx.run_id,
            "name": name,
            "status": status,
            "order": ctx.next_order,
            "latency_ms": stage_start.elapsed().as_millis() as u64,
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut payload, extra) {
            for (key, value) in extra {
                if !value.is_null() {
                    base.insert(key, value);
                }
            }
        }
        self.publish(ctx, EventKind::RunStep, payload);
    }

    fn emit_final_step(
        &self,
        ctx: &mut TurnContext,
        run_status: &str,
        picked_provider: Option<&str>,
        fallbacks_count: usize,
        extra: Value,
    ) {
        let mut payload = json!({
            "run_status": run_status,
            "latency_ms": ctx.started.elapsed().as_millis() as u64,
            "fallbacks_count": fallbacks_count,
        });
        if let Some(provider) = picked_provider {
            payload["picked_provider"] = json!(provider);
        }
        if let (Value::Object(base), Value::Object(extra)) = (&mut payload, extra) {
            for (key, value) in extra {
                if !value.is_null() {
                    base.insert(key, value);
                }
            }
        }
        self.emit_step(ctx, "trace_emit", "success", ctx.started, payload);
    }

    fn outcome(
        &self,
        ctx: &TurnContext,
        status: ChatStatus,
        text: Option<String>,
        intent: IntentKind,
    ) -> ChatOutcome {
        ChatOutcome {
            status,
            text,
            reason_safe: None,
            retry_after_secs: None,
            run_id: ctx.run_id.clone(),
            trace_id: ctx.trace_id.clone(),
            conversation_id: ctx.conversation_id.clone(),
            picked_provider: None,
            fallbacks_count: 0,
            latency_ms: ctx.started.elapsed().as_millis() as u64,
            intent,
            fault: None,
        }
    }
}

impl ChatOutcome {
    fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason_safe = Some(reason.into());
        self
    }

    fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    fn with_route(mut self, route: &crate::router::RouteOutcome) -> Self {
        self.picked_provider = route.picked_provider.clone();
        self.fallbacks_count = route.fallbacks_count();
        self
    }
}

/// Deterministic canary admission by trace id.
fn canary_admits(trace_id: &str, percent: u8) -> bool {
    if percent == 0 {
        return false;
    }
    if percent >= 100 {
        return true;
    }
    let digest = derive_id(&[trace_id]);
    let bucket = u64::from_str_radix(&digest[..8], 16).unwrap_or(0) % 100;
    (bucket as u8) < percent
}

/// Deterministic clarifying question for low-confidence turns.
fn clarifying_question(message: &str) -> String {
    let excerpt: String = message.chars().take(80).collect();
    format!(
        "I want to be sure I help with the right thing. When you say \"{}\", would you like me to \
         (a) answer a question about it, (b) look something up, or (c) make a change? \
         A little more detail will let me proceed.",
        excerpt.trim()
    )
}
