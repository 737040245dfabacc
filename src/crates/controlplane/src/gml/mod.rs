//! Graph Materialization Layer
//!
//! The single bus subscriber that projects events into the graph. Every
//! event maps (or does not) to a typed mutation; a deterministic mutation
//! id makes application idempotent, and every failure mode is fail-open:
//! unknown kinds are counted, an unavailable graph skips the mutation and
//! leaves the event in the durable log for replay.

pub mod map;
pub mod replay;

pub use map::{map_event, Mutation, LAYERS};
pub use replay::Replayer;

use crate::flags::{FlagStore, FLAG_MATERIALIZER_ENABLED};
use events::{Event, Subscription};
use graphstore::{DedupeStore, GraphDriver, GraphError, NodeLabel, UpsertSpec};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tooling::redact::{derive_id, redact_value, RedactionCounters, MAX_STR_LEN_GRAPH};

/// What happened to one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializeResult {
    /// The mutation was applied
    Applied,
    /// The mutation id was already in the dedupe set
    DedupHit,
    /// No map entry (or required payload keys missing)
    Unhandled,
    /// The graph was unavailable or legacy; the event stays in the log
    SkippedLegacy,
    /// A non-retryable storage failure
    Failed,
    /// The materializer flag is off
    Disabled,
}

/// Point-in-time materializer counters
#[derive(Debug, Clone)]
pub struct GmlStats {
    /// Mutations applied
    pub applied: u64,
    /// Dedupe hits
    pub dedup_hit: u64,
    /// Events without a map entry
    pub unhandled: u64,
    /// Mutations skipped while the graph was unavailable
    pub skipped_legacy: u64,
    /// Non-retryable failures
    pub failed: u64,
    /// Denied keys dropped at the graph boundary
    pub redaction_denied_keys: u64,
    /// Strings hashed at the graph boundary
    pub redaction_truncated: u64,
}

/// The materializer
pub struct Materializer {
    driver: Arc<GraphDriver>,
    dedupe: DedupeStore,
    flags: Arc<FlagStore>,
    redaction: RedactionCounters,
    applied: AtomicU64,
    dedup_hit: AtomicU64,
    unhandled: AtomicU64,
    skipped_legacy: AtomicU64,
    failed: AtomicU64,
}

impl Materializer {
    /// Create a materializer over the graph driver.
    pub fn new(driver: Arc<GraphDriver>, dedupe: DedupeStore, flags: Arc<FlagStore>) -> Self {
        Self {
            driver,
            dedupe,
            flags,
            redaction: RedactionCounters::new(),
            applied: AtomicU64::new(0),
            dedup_hit: AtomicU64::new(0),
            unhandled: AtomicU64::new(0),
            skipped_legacy: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Consume a bus subscription until the bus shuts down.
    ///
    /// Never propagates errors to the publisher or the request path.
    pub async fn run(self: Arc<Self>, mut subscription: Subscription) {
        tracing::info!("Materializer consuming as {}", subscription.name);
        while let Some(event) = subscription.rx.recv().await {
            self.process(&event).await;
        }
        tracing::info!("Materializer subscription closed");
    }

    /// Project one event into the graph.
    pub async fn process(&self, event: &Event) -> MaterializeResult {
        if !self.flags.bool_flag(FLAG_MATERIALIZER_ENABLED, true) {
            return MaterializeResult::Disabled;
        }

        // Second redaction boundary: graph limits are tighter than log
        // limits.
        let mut redacted = event.clone();
        redacted.payload = redact_value(redacted.payload, MAX_STR_LEN_GRAPH, &self.redaction);

        let Some(mutation) = map_event(&redacted) else {
            self.unhandled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("No mutation map entry for {}", event.kind);
            return MaterializeResult::Unhandled;
        };

        let mutation_id = derive_id(&[
            &event.event_id.to_string(),
            mutation.mutation_kind,
            &mutation.stable_key,
        ]);

        match self.dedupe.contains(&mutation_id).await {
            Ok(true) => {
                self.dedup_hit.fetch_add(1, Ordering::Relaxed);
                return MaterializeResult::DedupHit;
            }
            Ok(false) => {}
            Err(e) => {
                self.skipped_legacy.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dedupe check failed, skipping mutation: {}", e);
                return MaterializeResult::SkippedLegacy;
            }
        }

        for spec in &mutation.upserts {
            match self.driver.upsert(spec).await {
                Ok(()) => {}
                Err(GraphError::Unavailable(_)) | Err(GraphError::LegacyMode) => {
                    self.skipped_legacy.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        "Graph unavailable, mutation {} stays in the log",
                        mutation.mutation_kind
                    );
                    return MaterializeResult::SkippedLegacy;
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Mutation {} failed: {}", mutation.mutation_kind, e);
                    return MaterializeResult::Failed;
                }
            }
        }

        self.stamp_freshness(&mutation, event).await;

        if let Err(e) = self.dedupe.insert(&mutation_id).await {
            tracing::warn!("Dedupe insert failed for {}: {}", mutation_id, e);
        }

        self.applied.fetch_add(1, Ordering::Relaxed);
        MaterializeResult::Applied
    }

    /// Stamp the touched component and freshness layer. Best-effort.
    async fn stamp_freshness(&self, mutation: &Mutation, event: &Event) {
        if let Some(component) = &mutation.touched_component {
            let spec = UpsertSpec::new(NodeLabel::Component, component).with_props(json!({
                "freshness_ts": event.ts.to_rfc3339(),
                "last_ok_ts": event.ts.to_rfc3339(),
            }));
            if let Err(e) = self.driver.upsert(&spec).await {
                tracing::debug!("Freshness stamp skipped for {}: {}", component, e);
            }
        }

        if let Err(e) = self.driver.touch_layer(mutation.layer).await {
            tracing::debug!("Layer stamp skipped for {}: {}", mutation.layer, e);
        }
    }

    /// Snapshot of materializer counters.
    pub fn stats(&self) -> GmlStats {
        GmlStats {
            applied: self.applied.load(Ordering::Relaxed),
            dedup_hit: self.dedup_hit.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            skipped_legacy: self.skipped_legacy.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            redaction_denied_keys: self.redaction.denied_key_dropped(),
            redaction_truncated: self.redaction.string_truncated(),
        }
    }

    /// The driver this materializer writes through.
    pub fn driver(&self) -> &Arc<GraphDriver> {
        &self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use events::{EventKind, SCHEMA_VERSION};
    use graphstore::ReadQuery;
    use serde_json::json;
    use uuid::Uuid;

    async fn materializer() -> Arc<Materializer> {
        let driver = Arc::new(
            GraphDriver::connect_with_max_connections("sqlite::memory:", 1)
                .await
                .unwrap(),
        );
        let dedupe = DedupeStore::new(driver.pool().clone());
        Arc::new(Materializer::new(driver, dedupe, Arc::new(FlagStore::new())))
    }

    fn event(kind: EventKind, payload: serde_json::Value) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            seq: 1,
            ts: Utc::now(),
            kind,
            schema_version: SCHEMA_VERSION,
            conversation_id: Some("conv".to_string()),
            trace_id: "trace".to_string(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_apply_creates_node() {
        let gml = materializer().await;
        let result = gml
            .process(&event(EventKind::ChatMessage, json!({"run_id": "r1"})))
            .await;

        assert_eq!(result, MaterializeResult::Applied);
        let run = gml
            .driver()
            .get_node(NodeLabel::Run, "r1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.prop_str("status"), Some("running"));
        assert_eq!(gml.stats().applied, 1);
    }

    #[tokio::test]
    async fn test_same_event_applies_once() {
        let gml = materializer().await;
        let e = event(EventKind::ChatMessage, json!({"run_id": "r1"}));

        assert_eq!(gml.process(&e).await, MaterializeResult::Applied);
        assert_eq!(gml.process(&e).await, MaterializeResult::DedupHit);
        assert_eq!(gml.process(&e).await, MaterializeResult::DedupHit);

        let stats = gml.stats();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.dedup_hit, 2);
    }

    #[tokio::test]
    async fn test_unknown_kind_counted_not_failed() {
        let gml = materializer().await;
        let result = gml
            .process(&event(EventKind::from("mystery.kind".to_string()), json!({})))
            .await;

        assert_eq!(result, MaterializeResult::Unhandled);
        assert_eq!(gml.stats().unhandled, 1);
        assert_eq!(gml.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_denied_key_never_reaches_graph() {
        let gml = materializer().await;
        gml.process(&event(
            EventKind::ChatMessage,
            json!({"run_id": "r1", "prompt": "secret"}),
        ))
        .await;

        let run = gml
            .driver()
            .get_node(NodeLabel::Run, "r1")
            .await
            .unwrap()
            .unwrap();
        assert!(!run.props.to_string().contains("secret"));
        assert_eq!(gml.stats().redaction_denied_keys, 1);
    }

    #[tokio::test]
    async fn test_graph_down_skips_and_leaves_log_authoritative() {
        let gml = materializer().await;
        gml.driver().pool().close().await;

        let result = gml
            .process(&event(EventKind::ChatMessage, json!({"run_id": "r1"})))
            .await;

        assert_eq!(result, MaterializeResult::SkippedLegacy);
        assert_eq!(gml.stats().skipped_legacy, 1);
    }

    #[tokio::test]
    async fn test_materializer_flag_disables() {
        let gml = materializer().await;
        gml.flags.set(FLAG_MATERIALIZER_ENABLED, "false");

        let result = gml
            .process(&event(EventKind::ChatMessage, json!({"run_id": "r1"})))
            .await;
        assert_eq!(result, MaterializeResult::Disabled);
    }

    #[tokio::test]
    async fn test_freshness_stamped_on_touch() {
        let gml = materializer().await;
        gml.process(&event(EventKind::ChatMessage, json!({"run_id": "r1"})))
            .await;

        let component = gml
            .driver()
            .get_node(NodeLabel::Component, "chat_cp")
            .await
            .unwrap()
            .unwrap();
        assert!(component.prop_str("freshness_ts").is_some());

        let layers = gml.driver().layers().await.unwrap();
        assert!(layers.iter().any(|(name, _)| name == "runs"));
    }

    #[tokio::test]
    async fn test_forward_only_run_status_under_replay() {
        let gml = materializer().await;

        gml.process(&event(EventKind::ChatMessage, json!({"run_id": "r1"})))
            .await;
        gml.process(&event(
            EventKind::RunStep,
            json!({"run_id": "r1", "name": "trace_emit", "status": "success", "order": 6, "run_status": "ok"}),
        ))
        .await;

        // A late replayed "running" write cannot reopen the run.
        gml.process(&event(EventKind::ChatMessage, json!({"run_id": "r1"})))
            .await;

        let run = gml
            .driver()
            .get_node(NodeLabel::Run, "r1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.prop_str("status"), Some("ok"));
    }

    #[tokio::test]
    async fn test_steps_queryable_by_run() {
        let gml = materializer().await;
        gml.process(&event(
            EventKind::RunStep,
            json!({"run_id": "r1", "name": "rate_check", "status": "success", "order": 1}),
        ))
        .await;
        gml.process(&event(
            EventKind::RunStep,
            json!({"run_id": "r1", "name": "route", "status": "success", "order": 4}),
        ))
        .await;

        let edges = gml
            .driver()
            .read_edges(NodeLabel::Run, "r1", Some("HAS_STEP"))
            .await
            .unwrap();
        assert_eq!(edges.len(), 2);

        let steps = gml
            .driver()
            .read(&ReadQuery::label(NodeLabel::Step))
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);
    }
}
