//! Circuit breaker for flaky dependencies
//!
//! Opens after a run of consecutive failures, stays open for a cooldown,
//! then half-opens and admits a single probe. Both the graph driver and the
//! per-provider router circuits are built on this.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls fail fast until the cooldown elapses
    Open,
    /// One probe call is in flight
    HalfOpen,
}

impl BreakerState {
    /// Short name for telemetry output
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker with half-open probing
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `failure_threshold` consecutive
    /// failures and stays open for `cooldown`.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// While open, returns `false` until the cooldown elapses; the first
    /// caller after the cooldown becomes the half-open probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call, closing the circuit.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a failed call.
    ///
    /// A failed half-open probe re-opens immediately; otherwise the circuit
    /// opens once the consecutive-failure threshold is reached.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trip = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Consecutive failures observed since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_closed() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::ZERO);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Cooldown of zero: the next allow() is the probe.
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Only one probe is admitted.
        assert!(!breaker.allow());
    }

    #[test]
    fn test_probe_success_closes() {
        let breaker = CircuitBreaker::new(1, Duration::ZERO);

        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_success();

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(5, Duration::ZERO);

        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(BreakerState::Closed.as_str(), "closed");
        assert_eq!(BreakerState::Open.as_str(), "open");
        assert_eq!(BreakerState::HalfOpen.as_str(), "half_open");
    }
}
