//! Per-caller rate limiting
//!
//! Token bucket per caller with per-route overrides. Bucket state lives in
//! the shared KV table so sibling processes agree on counts; any KV error
//! fails open to a process-local bucket and bumps a counter. Decisions are
//! advisory: the pipeline turns them into 429 responses and events.

use chrono::Utc;
use dashmap::DashMap;
use graphstore::SqliteKv;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How long idle bucket state lives in the KV table
const BUCKET_TTL: Duration = Duration::from_secs(600);

/// Limits applied to one route class
#[derive(Debug, Clone, Copy)]
pub struct RouteLimits {
    /// Sustained tokens per minute
    pub per_minute: u32,
    /// Bucket capacity
    pub burst: u32,
}

/// Resolve the limits for a request path.
pub fn limits_for_route(route: &str) -> RouteLimits {
    if route == "/chat" {
        RouteLimits { per_minute: 60, burst: 100 }
    } else if route.starts_with("/internal") {
        RouteLimits { per_minute: 1000, burst: 2000 }
    } else {
        RouteLimits { per_minute: 120, burst: 240 }
    }
}

fn route_class(route: &str) -> &'static str {
    if route == "/chat" {
        "chat"
    } else if route.starts_with("/internal") {
        "internal"
    } else {
        "default"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_refill_ms: i64,
}

impl BucketState {
    fn full(limits: &RouteLimits, now_ms: i64) -> Self {
        Self {
            tokens: limits.burst as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Refill and try to take one token. Returns seconds to wait when
    /// rejected.
    fn take(&mut self, limits: &RouteLimits, now_ms: i64) -> (bool, u64) {
        let rate_per_ms = limits.per_minute as f64 / 60_000.0;
        let elapsed = (now_ms - self.last_refill_ms).max(0) as f64;
        self.tokens = (self.tokens + elapsed * rate_per_ms).min(limits.burst as f64);
        self.last_refill_ms = now_ms;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            (true, 0)
        } else {
            let deficit = 1.0 - self.tokens;
            let wait_ms = deficit / rate_per_ms;
            (false, (wait_ms / 1000.0).ceil() as u64)
        }
    }
}

/// Outcome of a rate check
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Suggested wait when rejected
    pub retry_after_secs: u64,
    /// Whether the process-local fallback served this decision
    pub fallback_used: bool,
}

/// Point-in-time limiter counters
#[derive(Debug, Clone)]
pub struct RateLimitStats {
    /// Requests admitted
    pub allowed_total: u64,
    /// Requests rejected
    pub rejected_total: u64,
    /// Decisions served by the local fallback
    pub fallback_total: u64,
}

/// Token-bucket rate limiter with shared state and local fallback
pub struct RateLimiter {
    kv: Option<SqliteKv>,
    local: DashMap<String, Mutex<BucketState>>,
    allowed: AtomicU64,
    rejected: AtomicU64,
    fallback: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter backed by the shared KV store.
    pub fn new(kv: SqliteKv) -> Self {
        Self {
            kv: Some(kv),
            local: DashMap::new(),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            fallback: AtomicU64::new(0),
        }
    }

    /// Create a limiter with no shared backend (local buckets only).
    pub fn local_only() -> Self {
        Self {
            kv: None,
            local: DashMap::new(),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            fallback: AtomicU64::new(0),
        }
    }

    /// Check whether `caller_id` may call `route` right now.
    pub async fn check(&self, caller_id: &str, route: &str) -> RateDecision {
        let limits = limits_for_route(route);
        let key = format!("rl:{}:{}", route_class(route), caller_id);

        let decision = if let Some(kv) = &self.kv {
            match self.check_shared(kv, &key, &limits).await {
                Ok(decision) => decision,
                Err(e) => {
                    self.fallback.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Rate limiter falling back to local bucket: {}", e);
                    let mut decision = self.check_local(&key, &limits);
                    decision.fallback_used = true;
                    decision
                }
            }
        } else {
            self.check_local(&key, &limits)
        };

        if decision.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    async fn check_shared(
        &self,
        kv: &SqliteKv,
        key: &str,
        limits: &RouteLimits,
    ) -> graphstore::Result<RateDecision> {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = match kv.get(key).await? {
            Some(text) => serde_json::from_str(&text).unwrap_or_else(|_| BucketState::full(limits, now_ms)),
            None => BucketState::full(limits, now_ms),
        };

        let (allowed, retry_after_secs) = state.take(limits, now_ms);

        let text = serde_json::to_string(&state).map_err(graphstore::GraphError::Serialization)?;
        kv.put(key, &text, Some(BUCKET_TTL)).await?;

        Ok(RateDecision {
            allowed,
            retry_after_secs,
            fallback_used: false,
        })
    }

    fn check_local(&self, key: &str, limits: &RouteLimits) -> RateDecision {
        let now_ms = Utc::now().timestamp_millis();
        let entry = self
            .local
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(BucketState::full(limits, now_ms)));

        let (allowed, retry_after_secs) = entry.lock().take(limits, now_ms);
        RateDecision {
            allowed,
            retry_after_secs,
            fallback_used: false,
        }
    }

    /// Snapshot of limiter counters.
    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            allowed_total: self.allowed.load(Ordering::Relaxed),
            rejected_total: self.rejected.load(Ordering::Relaxed),
            fallback_total: self.fallback.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphstore::schema::init_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn shared_limiter() -> RateLimiter {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        RateLimiter::new(SqliteKv::new(pool))
    }

    #[test]
    fn test_route_limits() {
        assert_eq!(limits_for_route("/chat").per_minute, 60);
        assert_eq!(limits_for_route("/chat").burst, 100);
        assert_eq!(limits_for_route("/internal/flags").per_minute, 1000);
        assert_eq!(limits_for_route("/internal/flags").burst, 2000);
    }

    #[tokio::test]
    async fn test_burst_capacity_boundary() {
        let limiter = shared_limiter().await;

        // Exactly the bucket capacity is admitted.
        for _ in 0..100 {
            let decision = limiter.check("flood", "/chat").await;
            assert!(decision.allowed);
        }

        // One above is rejected with a retry hint.
        let decision = limiter.check("flood", "/chat").await;
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs >= 1);

        let stats = limiter.stats();
        assert_eq!(stats.allowed_total, 100);
        assert_eq!(stats.rejected_total, 1);
        assert_eq!(stats.fallback_total, 0);
    }

    #[tokio::test]
    async fn test_callers_are_independent() {
        let limiter = shared_limiter().await;

        for _ in 0..100 {
            assert!(limiter.check("a", "/chat").await.allowed);
        }
        assert!(!limiter.check("a", "/chat").await.allowed);
        assert!(limiter.check("b", "/chat").await.allowed);
    }

    #[tokio::test]
    async fn test_kv_error_falls_back_to_local() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        let limiter = RateLimiter::new(SqliteKv::new(pool.clone()));
        pool.close().await;

        let decision = limiter.check("u", "/chat").await;
        assert!(decision.allowed);
        assert!(decision.fallback_used);
        assert_eq!(limiter.stats().fallback_total, 1);
    }

    #[tokio::test]
    async fn test_local_only_limiter_enforces() {
        let limiter = RateLimiter::local_only();

        for _ in 0..100 {
            assert!(limiter.check("u", "/chat").await.allowed);
        }
        assert!(!limiter.check("u", "/chat").await.allowed);
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let limits = RouteLimits { per_minute: 60, burst: 2 };
        let mut state = BucketState::full(&limits, 0);

        assert!(state.take(&limits, 0).0);
        assert!(state.take(&limits, 0).0);
        assert!(!state.take(&limits, 0).0);

        // One token per second at 60/min: refilled after a second.
        assert!(state.take(&limits, 1000).0);
    }
}
