//! Inference router
//!
//! Scores provider candidates by latency, error rate, cost and context
//! fit, dispatches with a per-provider timeout, and cascades through the
//! fallback chain on failure. The deterministic local provider is always
//! the terminal candidate, so routing can only exhaust when the caller's
//! deadline does. Every attempt is recorded as a `provider.used` event and
//! in the provider's rolling metrics.

use crate::flags::{
    FlagStore, FLAG_WEIGHT_CONTEXT, FLAG_WEIGHT_COST, FLAG_WEIGHT_ERROR, FLAG_WEIGHT_LATENCY,
};
use dashmap::DashMap;
use events::{EventBus, EventDraft, EventKind};
use futures::StreamExt;
use graphstore::{GraphDriver, NodeLabel, ReadQuery};
use llm::local::LOCAL_PROVIDER_ID;
use llm::{ChatProvider, ChatRequest, LlmError, MetricsSnapshot, ProviderMetrics};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tooling::breaker::{BreakerState, CircuitBreaker};
use tooling::redact::derive_id;

/// Consecutive provider errors before its circuit opens
const PROVIDER_BREAKER_THRESHOLD: u32 = 5;

/// Provider circuit cooldown
const PROVIDER_BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Windowed error rate at which a provider is skipped outright
const WINDOW_TRIP_RATE: f64 = 0.5;

/// Minimum window samples before the windowed trip applies
const WINDOW_TRIP_MIN_CALLS: u64 = 10;

/// Normalization ceiling for the latency score term (ms)
const LATENCY_NORM_MS: f64 = 10_000.0;

/// Normalization ceiling for the cost score term
const COST_NORM_UNITS: f64 = 10.0;

/// A registered provider with its rolling state
pub struct ProviderEntry {
    /// The provider implementation
    pub provider: Arc<dyn ChatProvider>,
    /// Rolling latency and error metrics
    pub metrics: ProviderMetrics,
    /// Per-provider circuit
    pub breaker: CircuitBreaker,
}

/// One failed attempt in a fallback cascade
#[derive(Debug, Clone)]
pub struct FallbackRecord {
    /// Provider that failed
    pub provider_id: String,
    /// Short error kind
    pub error_kind: String,
}

/// Result of routing one request
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// Collected response text (empty on total failure)
    pub text: String,
    /// Provider that produced the response
    pub picked_provider: Option<String>,
    /// Failed attempts before (or instead of) success
    pub fallbacks: Vec<FallbackRecord>,
    /// Wall time spent routing
    pub latency_ms: u64,
    /// Whether the outcome is degraded
    pub degraded: bool,
    /// Final error kind when degraded or failed
    pub error_kind: Option<String>,
}

impl RouteOutcome {
    /// Number of fallback attempts taken
    pub fn fallbacks_count(&self) -> usize {
        self.fallbacks.len()
    }
}

/// Scored, cascading provider router
pub struct InferenceRouter {
    entries: DashMap<String, Arc<ProviderEntry>>,
    graph: Arc<GraphDriver>,
    flags: Arc<FlagStore>,
    bus: Arc<EventBus>,
    provider_timeout: Duration,
    max_fallbacks: usize,
}

impl InferenceRouter {
    /// Create a router.
    pub fn new(
        graph: Arc<GraphDriver>,
        flags: Arc<FlagStore>,
        bus: Arc<EventBus>,
        provider_timeout: Duration,
        max_fallbacks: usize,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            graph,
            flags,
            bus,
            provider_timeout,
            max_fallbacks,
        }
    }

    /// Register a provider.
    pub fn register(&self, provider: Arc<dyn ChatProvider>) {
        let id = provider.profile().id.clone();
        self.entries.insert(
            id,
            Arc::new(ProviderEntry {
                provider,
                metrics: ProviderMetrics::new(),
                breaker: CircuitBreaker::new(PROVIDER_BREAKER_THRESHOLD, PROVIDER_BREAKER_COOLDOWN),
            }),
        );
    }

    /// Registered provider ids.
    pub fn provider_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Metrics and breaker state per provider, for telemetry.
    pub fn provider_states(&self) -> Vec<(String, MetricsSnapshot, BreakerState)> {
        self.entries
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().metrics.snapshot(),
                    e.value().breaker.state(),
                )
            })
            .collect()
    }

    /// Build the ordered candidate list for a request.
    ///
    /// The graph supplies the provider directory; when it is unreachable
    /// every registered provider is a candidate (fail-open). Scored
    /// candidates come first, the local terminal fallback last.
    async fn candidates(&self, request: &ChatRequest, trace_id: &str) -> Vec<Arc<ProviderEntry>> {
        let graph_ids: Option<Vec<String>> = match self
            .graph
            .read(&ReadQuery::label(NodeLabel::Provider).with_prop("kind", json!("chat")))
            .await
        {
            Ok(rows) if !rows.is_empty() => Some(rows.into_iter().map(|r| r.id).collect()),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("Provider directory unavailable, using registry: {}", e);
                None
            }
        };

        let mut scored: Vec<(f64, f64, String, Arc<ProviderEntry>)> = Vec::new();
        for entry in self.entries.iter() {
            let id = entry.key();
            if id == LOCAL_PROVIDER_ID {
                continue;
            }
            if let Some(ids) = &graph_ids {
                if !ids.contains(id) {
                    continue;
                }
            }
            if !self.flags.provider_enabled(id) {
                continue;
            }

            let snapshot = entry.value().metrics.snapshot();
            if snapshot.total_calls >= WINDOW_TRIP_MIN_CALLS
                && snapshot.window_error_rate >= WINDOW_TRIP_RATE
            {
                tracing::debug!("Provider {} skipped: window error rate {:.2}", id, snapshot.window_error_rate);
                continue;
            }

            let score = self.score(entry.value(), &snapshot, request);
            let tiebreak = derive_id(&[trace_id, id]);
            scored.push((score, snapshot.window_error_rate, tiebreak, entry.value().clone()));
        }

        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.2.cmp(&b.2))
        });

        let mut out: Vec<Arc<ProviderEntry>> = scored.into_iter().map(|(_, _, _, e)| e).collect();
        if let Some(local) = self.entries.get(LOCAL_PROVIDER_ID) {
            out.push(local.value().clone());
        }
        out
    }

    /// Weighted score; lower is better.
    fn score(&self, entry: &ProviderEntry, snapshot: &MetricsSnapshot, request: &ChatRequest) -> f64 {
        let profile = entry.provider.profile();
        let w_lat = self.flags.f64_flag(FLAG_WEIGHT_LATENCY, 1.0);
        let w_err = self.flags.f64_flag(FLAG_WEIGHT_ERROR, 2.0);
        let w_cost = self.flags.f64_flag(FLAG_WEIGHT_COST, 0.5);
        let w_ctx = self.flags.f64_flag(FLAG_WEIGHT_CONTEXT, 1.0);

        let norm_latency = (snapshot.latency_p99_ms / LATENCY_NORM_MS).min(1.0);
        let norm_cost = (profile.cost_units / COST_NORM_UNITS).min(1.0);
        let ctx_penalty = if request.estimated_context() > profile.max_context {
            1.0
        } else {
            0.0
        };

        w_lat * norm_latency + w_err * snapshot.error_rate + w_cost * norm_cost + w_ctx * ctx_penalty
    }

    /// Route a request through the candidate cascade.
    ///
    /// `deadline` bounds the whole cascade; each attempt additionally gets
    /// at most the per-provider timeout. Cancellation (an elapsed
    /// deadline) aborts the in-flight attempt and ends the cascade.
    pub async fn route(
        &self,
        request: ChatRequest,
        trace_id: &str,
        run_id: &str,
        conversation_id: &str,
        deadline: Instant,
    ) -> RouteOutcome {
        let started = Instant::now();
        let candidates = self.candidates(&request, trace_id).await;
        let mut fallbacks: Vec<FallbackRecord> = Vec::new();
        let mut last_error: Option<String> = None;
        let mut attempts = 0usize;

        for entry in candidates {
            if attempts > self.max_fallbacks {
                break;
            }

            let provider_id = entry.provider.profile().id.clone();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_error = Some("cancelled".to_string());
                break;
            }

            if !entry.breaker.allow() {
                tracing::debug!("Provider {} circuit open, skipping", provider_id);
                continue;
            }

            attempts += 1;
            let budget = remaining.min(self.provider_timeout);
            let attempt_start = Instant::now();
            let result = Self::collect(&entry, request.clone(), budget).await;
            let attempt_ms = attempt_start.elapsed().as_millis() as f64;

            match result {
                Ok(text) => {
                    entry.metrics.record_success(attempt_ms);
                    entry.breaker.record_success();
                    self.emit_provider_used(
                        run_id,
                        conversation_id,
                        trace_id,
                        &provider_id,
                        "selected",
                        None,
                        attempt_ms as u64,
                    );

                    let from_terminal_fallback =
                        provider_id == LOCAL_PROVIDER_ID && !fallbacks.is_empty();
                    return RouteOutcome {
                        text,
                        picked_provider: Some(provider_id),
                        fallbacks,
                        latency_ms: started.elapsed().as_millis() as u64,
                        degraded: from_terminal_fallback,
                        error_kind: if from_terminal_fallback {
                            last_error
                        } else {
                            None
                        },
                    };
                }
                Err(error) => {
                    entry.metrics.record_failure(attempt_ms);
                    entry.breaker.record_failure();
                    let kind = error.kind().to_string();
                    tracing::warn!("Provider {} failed ({}), cascading", provider_id, kind);
                    self.emit_provider_used(
                        run_id,
                        conversation_id,
                        trace_id,
                        &provider_id,
                        "fallback",
                        Some(&kind),
                        attempt_ms as u64,
                    );
                    fallbacks.push(FallbackRecord {
                        provider_id,
                        error_kind: kind.clone(),
                    });
                    last_error = Some(kind);

                    if matches!(error, LlmError::Cancelled) {
                        break;
                    }
                }
            }
        }

        RouteOutcome {
            text: String::new(),
            picked_provider: None,
            fallbacks,
            latency_ms: started.elapsed().as_millis() as u64,
            degraded: true,
            error_kind: last_error.or_else(|| Some("no_candidates".to_string())),
        }
    }

    /// Run one provider attempt to completion under a budget.
    async fn collect(
        entry: &ProviderEntry,
        request: ChatRequest,
        budget: Duration,
    ) -> Result<String, LlmError> {
        let work = async {
            let mut stream = entry.provider.chat_stream(request).await?;
            let mut text = String::new();
            while let Some(chunk) = stream.next().await {
                text.push_str(&chunk?.content);
            }
            Ok(text)
        };

        match tokio::time::timeout(budget, work).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(budget.as_millis() as u64)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_provider_used(
        &self,
        run_id: &str,
        conversation_id: &str,
        trace_id: &str,
        provider_id: &str,
        role: &str,
        error_kind: Option<&str>,
        latency_ms: u64,
    ) {
        let mut payload = json!({
            "run_id": run_id,
            "provider_id": provider_id,
            "role": role,
            "latency_ms": latency_ms,
        });
        if let Some(kind) = error_kind {
            payload["error_kind"] = json!(kind);
        }

        self.bus.publish(
            EventDraft::new(EventKind::ProviderUsed)
                .with_conversation(conversation_id)
                .with_trace(trace_id)
                .with_payload(payload),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use llm::{ChatMessage, ChunkStream, DeterministicProvider, MessageChunk, ProviderProfile};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        id: String,
        cost: f64,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn ok(id: &str, cost: f64) -> Self {
            Self {
                id: id.to_string(),
                cost,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(id: &str) -> Self {
            Self {
                id: id.to_string(),
                cost: 1.0,
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for StubProvider {
        fn profile(&self) -> ProviderProfile {
            ProviderProfile::chat(self.id.clone(), self.cost, 100_000)
        }

        async fn chat_stream(&self, _request: ChatRequest) -> llm::Result<ChunkStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LlmError::Api {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            let id = self.id.clone();
            Ok(Box::pin(futures::stream::iter(vec![Ok(
                MessageChunk::new(format!("answer from {}", id)).final_chunk(),
            )])))
        }
    }

    async fn test_router() -> (InferenceRouter, Arc<EventBus>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(events::EventLog::new(dir.path().join("events")).unwrap());
        let bus = Arc::new(EventBus::new(log));
        let graph = Arc::new(
            GraphDriver::connect_with_max_connections("sqlite::memory:", 1)
                .await
                .unwrap(),
        );
        let flags = Arc::new(FlagStore::new());
        let router = InferenceRouter::new(
            graph,
            flags,
            bus.clone(),
            Duration::from_secs(2),
            3,
        );
        (router, bus, dir)
    }

    fn request() -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::user("hello")])
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn test_routes_to_single_provider() {
        let (router, _bus, _dir) = test_router().await;
        router.register(Arc::new(StubProvider::ok("primary", 1.0)));

        let outcome = router.route(request(), "t1", "r1", "c1", deadline()).await;

        assert_eq!(outcome.picked_provider.as_deref(), Some("primary"));
        assert_eq!(outcome.text, "answer from primary");
        assert!(!outcome.degraded);
        assert_eq!(outcome.fallbacks_count(), 0);
    }

    #[tokio::test]
    async fn test_fallback_on_provider_failure() {
        let (router, _bus, _dir) = test_router().await;
        router.register(Arc::new(StubProvider::failing("primary")));
        router.register(Arc::new(StubProvider::ok("secondary", 5.0)));

        // Make primary clearly preferred by score (lower cost).
        let outcome = router.route(request(), "t1", "r1", "c1", deadline()).await;

        assert!(outcome.picked_provider.is_some());
        assert_eq!(outcome.fallbacks_count(), 1);
        assert_eq!(outcome.fallbacks[0].error_kind, "api");
        assert!(!outcome.degraded);
    }

    #[tokio::test]
    async fn test_local_terminal_fallback_marks_degraded() {
        let (router, _bus, _dir) = test_router().await;
        router.register(Arc::new(StubProvider::failing("only-remote")));
        router.register(Arc::new(DeterministicProvider::new()));

        let outcome = router.route(request(), "t1", "r1", "c1", deadline()).await;

        assert_eq!(outcome.picked_provider.as_deref(), Some(LOCAL_PROVIDER_ID));
        assert!(outcome.degraded);
        assert!(!outcome.text.is_empty());
        assert_eq!(outcome.fallbacks_count(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_structured_failure() {
        let (router, _bus, _dir) = test_router().await;
        router.register(Arc::new(StubProvider::failing("a")));
        router.register(Arc::new(StubProvider::failing("b")));

        let outcome = router.route(request(), "t1", "r1", "c1", deadline()).await;

        assert!(outcome.picked_provider.is_none());
        assert!(outcome.degraded);
        assert!(outcome.text.is_empty());
        assert_eq!(outcome.error_kind.as_deref(), Some("api"));
    }

    #[tokio::test]
    async fn test_disabled_provider_excluded() {
        let (router, _bus, _dir) = test_router().await;
        router.register(Arc::new(StubProvider::ok("banned", 1.0)));
        router.register(Arc::new(StubProvider::ok("allowed", 1.0)));
        router.flags.set("provider_banned_enabled", "false");

        let outcome = router.route(request(), "t1", "r1", "c1", deadline()).await;
        assert_eq!(outcome.picked_provider.as_deref(), Some("allowed"));
    }

    #[tokio::test]
    async fn test_cheaper_provider_preferred() {
        let (router, _bus, _dir) = test_router().await;
        router.register(Arc::new(StubProvider::ok("expensive", 9.0)));
        router.register(Arc::new(StubProvider::ok("cheap", 0.5)));

        let outcome = router.route(request(), "t1", "r1", "c1", deadline()).await;
        assert_eq!(outcome.picked_provider.as_deref(), Some("cheap"));
    }

    #[tokio::test]
    async fn test_provider_used_events_emitted() {
        let (router, bus, _dir) = test_router().await;
        let mut sub = bus.subscribe("test", 16);
        router.register(Arc::new(StubProvider::failing("bad")));
        router.register(Arc::new(StubProvider::ok("good", 5.0)));

        router.route(request(), "t1", "r1", "c1", deadline()).await;

        let mut roles = Vec::new();
        while let Ok(event) = sub.rx.try_recv() {
            if event.kind == EventKind::ProviderUsed {
                roles.push(event.payload["role"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(roles, vec!["fallback", "selected"]);
    }

    #[tokio::test]
    async fn test_elapsed_deadline_cancels_cascade() {
        let (router, _bus, _dir) = test_router().await;
        router.register(Arc::new(StubProvider::ok("fine", 1.0)));

        let past = Instant::now() - Duration::from_secs(1);
        let outcome = router.route(request(), "t1", "r1", "c1", past).await;

        assert!(outcome.degraded);
        assert_eq!(outcome.error_kind.as_deref(), Some("cancelled"));
    }
}
