//! Telemetry
//!
//! Rolling request counters, a fixed-bucket latency histogram, per-layer
//! freshness classification and the stable `/telemetry` snapshot. Every
//! field that depends on an unreachable backend renders as `"unknown"`
//! rather than an error; the endpoints themselves always answer 200.

use crate::config::AppConfig;
use crate::flags::{FlagStore, FLAG_ASYNC_ENABLED};
use crate::gml::{Materializer, LAYERS};
use crate::pipeline::ChatStatus;
use crate::ratelimit::RateLimiter;
use crate::router::InferenceRouter;
use crate::workers::WorkerPool;
use chrono::Utc;
use events::EventBus;
use graphstore::GraphDriver;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tooling::breaker::BreakerState;

/// Histogram bucket upper bounds in milliseconds
pub const LATENCY_BUCKETS_MS: [u64; 9] = [25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// Freshness classification of one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    /// Updated within the staleness window
    Live,
    /// Updated, but too long ago
    Stale,
    /// Never updated, or the graph is unreachable
    Unknown,
}

impl LayerState {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerState::Live => "live",
            LayerState::Stale => "stale",
            LayerState::Unknown => "unknown",
        }
    }
}

/// Rolling one-hour counter over per-minute slots
struct MinuteRing {
    slots: [AtomicU64; 60],
    stamps: [AtomicI64; 60],
}

impl MinuteRing {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU64::new(0)),
            stamps: std::array::from_fn(|_| AtomicI64::new(-1)),
        }
    }

    fn record(&self) {
        let minute = Utc::now().timestamp() / 60;
        let idx = (minute % 60) as usize;
        if self.stamps[idx].swap(minute, Ordering::Relaxed) != minute {
            self.slots[idx].store(0, Ordering::Relaxed);
        }
        self.slots[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn total_last_hour(&self) -> u64 {
        let minute = Utc::now().timestamp() / 60;
        (0..60)
            .filter(|i| minute - self.stamps[*i].load(Ordering::Relaxed) < 60)
            .map(|i| self.slots[i].load(Ordering::Relaxed))
            .sum()
    }
}

/// Request-level counters and histogram
pub struct TelemetryRegistry {
    requests_total: AtomicU64,
    requests_error: AtomicU64,
    requests_1h: MinuteRing,
    errors_1h: MinuteRing,
    latency_buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    latency_sum_ms: AtomicU64,
    chat_ok: AtomicU64,
    chat_degraded: AtomicU64,
    chat_blocked: AtomicU64,
    chat_rate_limited: AtomicU64,
    chat_failed: AtomicU64,
    started_ts: i64,
}

impl TelemetryRegistry {
    /// Create a zeroed registry.
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_error: AtomicU64::new(0),
            requests_1h: MinuteRing::new(),
            errors_1h: MinuteRing::new(),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_sum_ms: AtomicU64::new(0),
            chat_ok: AtomicU64::new(0),
            chat_degraded: AtomicU64::new(0),
            chat_blocked: AtomicU64::new(0),
            chat_rate_limited: AtomicU64::new(0),
            chat_failed: AtomicU64::new(0),
            started_ts: Utc::now().timestamp(),
        }
    }

    /// Record one handled chat request.
    pub fn record_request(&self, latency_ms: u64, status: ChatStatus) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_1h.record();
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);

        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| latency_ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[idx].fetch_add(1, Ordering::Relaxed);

        match status {
            ChatStatus::Ok => self.chat_ok.fetch_add(1, Ordering::Relaxed),
            ChatStatus::Degraded => self.chat_degraded.fetch_add(1, Ordering::Relaxed),
            ChatStatus::Blocked => self.chat_blocked.fetch_add(1, Ordering::Relaxed),
            ChatStatus::RateLimited => self.chat_rate_limited.fetch_add(1, Ordering::Relaxed),
            ChatStatus::Failed => self.chat_failed.fetch_add(1, Ordering::Relaxed),
        };

        if matches!(status, ChatStatus::Failed) {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
            self.errors_1h.record();
        }
    }

    /// Approximate p95 latency from the histogram.
    pub fn p95_ms(&self) -> u64 {
        let total: u64 = self.latency_buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum();
        if total == 0 {
            return 0;
        }
        let target = (total as f64 * 0.95).ceil() as u64;
        let mut seen = 0;
        for (i, bucket) in self.latency_buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return LATENCY_BUCKETS_MS.get(i).copied().unwrap_or(u64::MAX);
            }
        }
        u64::MAX
    }

    /// Error rate over the last hour.
    pub fn error_rate_1h(&self) -> f64 {
        let total = self.requests_1h.total_last_hour();
        if total == 0 {
            0.0
        } else {
            self.errors_1h.total_last_hour() as f64 / total as f64
        }
    }

    /// Requests in the last hour.
    pub fn total_1h(&self) -> u64 {
        self.requests_1h.total_last_hour()
    }

    /// Seconds since startup.
    pub fn uptime_secs(&self) -> i64 {
        Utc::now().timestamp() - self.started_ts
    }
}

impl Default for TelemetryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the telemetry endpoints read from
#[derive(Clone)]
pub struct TelemetryHandles {
    /// Request counters
    pub registry: Arc<TelemetryRegistry>,
    /// The event bus
    pub bus: Arc<EventBus>,
    /// The graph driver
    pub driver: Arc<GraphDriver>,
    /// The materializer
    pub gml: Arc<Materializer>,
    /// The worker pool
    pub workers: Arc<WorkerPool>,
    /// The rate limiter
    pub limiter: Arc<RateLimiter>,
    /// The router
    pub router: Arc<InferenceRouter>,
    /// Feature flags
    pub flags: Arc<FlagStore>,
    /// App configuration
    pub config: AppConfig,
}

/// Classify every canonical layer.
///
/// When the graph is unreachable all layers report `unknown`.
pub async fn layer_reports(handles: &TelemetryHandles) -> (Vec<Value>, Value) {
    let window_ms = handles.config.staleness_window.as_millis() as i64;
    let now_ms = Utc::now().timestamp_millis();

    let stamped: Option<Vec<(String, i64)>> = handles.driver.layers().await.ok();

    let mut live = 0u32;
    let mut stale = 0u32;
    let mut unknown = 0u32;
    let mut reports = Vec::with_capacity(LAYERS.len());

    for layer in LAYERS {
        let (state, last_update) = match &stamped {
            None => (LayerState::Unknown, None),
            Some(rows) => match rows.iter().find(|(name, _)| name == layer) {
                None => (LayerState::Unknown, None),
                Some((_, ts)) if now_ms - ts <= window_ms => (LayerState::Live, Some(*ts)),
                Some((_, ts)) => (LayerState::Stale, Some(*ts)),
            },
        };

        match state {
            LayerState::Live => live += 1,
            LayerState::Stale => stale += 1,
            LayerState::Unknown => unknown += 1,
        }

        reports.push(json!({
            "layer": layer,
            "state": state.as_str(),
            "last_update_ts": last_update.map(|ts| json!(ts)).unwrap_or(json!("unknown")),
        }));
    }

    let integrity_degraded = stamped.is_none() || stale > 0 || unknown > 0;
    let summary = json!({
        "live_count": live,
        "stale_count": stale,
        "unknown_count": unknown,
        "integrity_degraded": integrity_degraded,
    });

    (reports, summary)
}

/// Build the stable `/telemetry` snapshot.
pub async fn snapshot(handles: &TelemetryHandles) -> Value {
    let registry = &handles.registry;
    let bus_stats = handles.bus.stats();
    let gml_stats = handles.gml.stats();
    let worker_stats = handles.workers.stats();
    let limiter_stats = handles.limiter.stats();
    let (layers, summary) = layer_reports(handles).await;

    let heartbeat_window_ms = 2 * handles.config.heartbeat_interval.as_millis() as i64;
    let worker_seen = worker_stats.last_heartbeat_ms > 0
        && Utc::now().timestamp_millis() - worker_stats.last_heartbeat_ms <= heartbeat_window_ms;
    let materializer_stale = handles.driver.breaker_state() != BreakerState::Closed;
    let queue_depth: i64 = worker_stats.queue_depth.values().sum();

    let providers: Vec<Value> = handles
        .router
        .provider_states()
        .into_iter()
        .map(|(id, metrics, breaker)| {
            json!({
                "id": id,
                "latency_ewma_ms": metrics.latency_ewma_ms,
                "latency_p99_ms": metrics.latency_p99_ms,
                "error_rate": metrics.error_rate,
                "total_calls": metrics.total_calls,
                "breaker": breaker.as_str(),
            })
        })
        .collect();

    json!({
        "requests": {
            "total_1h": registry.total_1h(),
            "error_rate": registry.error_rate_1h(),
            "p95_ms": registry.p95_ms(),
        },
        "chat": {
            "ok": registry.chat_ok.load(Ordering::Relaxed),
            "degraded": registry.chat_degraded.load(Ordering::Relaxed),
            "blocked": registry.chat_blocked.load(Ordering::Relaxed),
            "rate_limited": registry.chat_rate_limited.load(Ordering::Relaxed),
            "failed": registry.chat_failed.load(Ordering::Relaxed),
        },
        "rate_limit": {
            "allowed": limiter_stats.allowed_total,
            "rejected": limiter_stats.rejected_total,
            "fallback": limiter_stats.fallback_total,
        },
        "bus": {
            "published": bus_stats.published_total,
            "dropped": bus_stats.dropped_total(),
            "quarantined": bus_stats.quarantined_total,
            "redaction_denied_keys": bus_stats.redaction_denied_keys,
        },
        "async": {
            "async_enabled": handles.flags.bool_flag(FLAG_ASYNC_ENABLED, true),
            "worker_seen": worker_seen,
            "materializer_stale": materializer_stale,
            "queue_depth": queue_depth,
        },
        "gml": {
            "applied": gml_stats.applied,
            "dedup_hit": gml_stats.dedup_hit,
            "unhandled": gml_stats.unhandled,
            "skipped_legacy": gml_stats.skipped_legacy,
            "redaction_denied_keys": gml_stats.redaction_denied_keys,
        },
        "graph": {
            "breaker": handles.driver.breaker_state().as_str(),
            "layers": layers,
            "summary": summary,
        },
        "providers": providers,
    })
}

/// Compact `/health` rollup. Always renderable.
pub async fn health(handles: &TelemetryHandles) -> Value {
    let (_, summary) = layer_reports(handles).await;
    let degraded = summary["integrity_degraded"].as_bool().unwrap_or(true)
        || handles.driver.breaker_state() != BreakerState::Closed;

    json!({
        "status": if degraded { "degraded" } else { "ok" },
        "graph_breaker": handles.driver.breaker_state().as_str(),
        "layers": summary,
        "uptime_secs": handles.registry.uptime_secs(),
    })
}

/// Render the Prometheus text exposition.
pub async fn prometheus(handles: &TelemetryHandles) -> String {
    let registry = &handles.registry;
    let bus_stats = handles.bus.stats();
    let gml_stats = handles.gml.stats();
    let worker_stats = handles.workers.stats();
    let limiter_stats = handles.limiter.stats();

    let mut out = String::with_capacity(4096);

    out.push_str("# TYPE synapse_requests_total counter\n");
    out.push_str(&format!(
        "synapse_requests_total {}\n",
        registry.requests_total.load(Ordering::Relaxed)
    ));
    out.push_str("# TYPE synapse_request_errors_total counter\n");
    out.push_str(&format!(
        "synapse_request_errors_total {}\n",
        registry.requests_error.load(Ordering::Relaxed)
    ));

    out.push_str("# TYPE synapse_request_latency_ms histogram\n");
    let mut cumulative = 0u64;
    for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
        cumulative += registry.latency_buckets[i].load(Ordering::Relaxed);
        out.push_str(&format!(
            "synapse_request_latency_ms_bucket{{le=\"{}\"}} {}\n",
            bound, cumulative
        ));
    }
    cumulative += registry.latency_buckets[LATENCY_BUCKETS_MS.len()].load(Ordering::Relaxed);
    out.push_str(&format!(
        "synapse_request_latency_ms_bucket{{le=\"+Inf\"}} {}\n",
        cumulative
    ));
    out.push_str(&format!(
        "synapse_request_latency_ms_sum {}\n",
        registry.latency_sum_ms.load(Ordering::Relaxed)
    ));
    out.push_str(&format!("synapse_request_latency_ms_count {}\n", cumulative));

    out.push_str("# TYPE synapse_chat_outcomes_total counter\n");
    for (status, counter) in [
        ("ok", &registry.chat_ok),
        ("degraded", &registry.chat_degraded),
        ("blocked", &registry.chat_blocked),
        ("rate_limited", &registry.chat_rate_limited),
        ("failed", &registry.chat_failed),
    ] {
        out.push_str(&format!(
            "synapse_chat_outcomes_total{{status=\"{}\"}} {}\n",
            status,
            counter.load(Ordering::Relaxed)
        ));
    }

    out.push_str("# TYPE synapse_rate_limit_total counter\n");
    out.push_str(&format!(
        "synapse_rate_limit_total{{outcome=\"allowed\"}} {}\n",
        limiter_stats.allowed_total
    ));
    out.push_str(&format!(
        "synapse_rate_limit_total{{outcome=\"rejected\"}} {}\n",
        limiter_stats.rejected_total
    ));
    out.push_str(&format!(
        "synapse_rate_limit_total{{outcome=\"fallback\"}} {}\n",
        limiter_stats.fallback_total
    ));

    out.push_str("# TYPE synapse_bus_dropped_events_total counter\n");
    for (subscriber, dropped) in &bus_stats.dropped_by_subscriber {
        out.push_str(&format!(
            "synapse_bus_dropped_events_total{{subscriber=\"{}\"}} {}\n",
            subscriber, dropped
        ));
    }

    out.push_str("# TYPE synapse_mutations_total counter\n");
    for (result, value) in [
        ("applied", gml_stats.applied),
        ("dedup_hit", gml_stats.dedup_hit),
        ("unhandled", gml_stats.unhandled),
        ("skipped_legacy", gml_stats.skipped_legacy),
        ("failed", gml_stats.failed),
    ] {
        out.push_str(&format!(
            "synapse_mutations_total{{result=\"{}\"}} {}\n",
            result, value
        ));
    }

    out.push_str("# TYPE synapse_graph_breaker_state gauge\n");
    let breaker_value = match handles.driver.breaker_state() {
        BreakerState::Closed => 0,
        BreakerState::HalfOpen => 1,
        BreakerState::Open => 2,
    };
    out.push_str(&format!("synapse_graph_breaker_state {}\n", breaker_value));

    out.push_str("# TYPE synapse_queue_depth gauge\n");
    for (queue, depth) in &worker_stats.queue_depth {
        out.push_str(&format!(
            "synapse_queue_depth{{queue=\"{}\"}} {}\n",
            queue, depth
        ));
    }

    out
}
