//! Rolling per-provider metrics
//!
//! Exponentially-weighted moving averages of latency and error rate, plus
//! a short outcome window for circuit decisions. The router reads these to
//! score candidates; every completed call records back into them.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Weight of the newest sample in the moving averages
const EWMA_ALPHA: f64 = 0.2;

/// Decay applied to the latency peak per observation
const PEAK_DECAY: f64 = 0.95;

/// Outcomes kept in the rolling window
const WINDOW_SIZE: usize = 50;

#[derive(Debug, Default)]
struct MetricsInner {
    latency_ewma_ms: f64,
    latency_peak_ms: f64,
    error_ewma: f64,
    window: VecDeque<bool>,
    total_calls: u64,
    total_errors: u64,
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Smoothed latency in milliseconds
    pub latency_ewma_ms: f64,
    /// Decayed latency peak, a cheap p99 stand-in
    pub latency_p99_ms: f64,
    /// Smoothed error rate in [0, 1]
    pub error_rate: f64,
    /// Error rate over the recent outcome window
    pub window_error_rate: f64,
    /// Calls recorded since startup
    pub total_calls: u64,
    /// Errors recorded since startup
    pub total_errors: u64,
}

/// Rolling metrics for one provider
#[derive(Debug, Default)]
pub struct ProviderMetrics {
    inner: Mutex<MetricsInner>,
}

impl ProviderMetrics {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful call and its latency.
    pub fn record_success(&self, latency_ms: f64) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.latency_ewma_ms = ewma(inner.latency_ewma_ms, latency_ms, inner.total_calls);
        inner.latency_peak_ms = (inner.latency_peak_ms * PEAK_DECAY).max(latency_ms);
        inner.error_ewma *= 1.0 - EWMA_ALPHA;
        push_window(&mut inner.window, false);
    }

    /// Record a failed call.
    pub fn record_failure(&self, latency_ms: f64) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.total_errors += 1;
        inner.latency_ewma_ms = ewma(inner.latency_ewma_ms, latency_ms, inner.total_calls);
        inner.latency_peak_ms = (inner.latency_peak_ms * PEAK_DECAY).max(latency_ms);
        inner.error_ewma = inner.error_ewma * (1.0 - EWMA_ALPHA) + EWMA_ALPHA;
        push_window(&mut inner.window, true);
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock();
        let window_errors = inner.window.iter().filter(|e| **e).count();
        MetricsSnapshot {
            latency_ewma_ms: inner.latency_ewma_ms,
            latency_p99_ms: inner.latency_peak_ms,
            error_rate: inner.error_ewma,
            window_error_rate: if inner.window.is_empty() {
                0.0
            } else {
                window_errors as f64 / inner.window.len() as f64
            },
            total_calls: inner.total_calls,
            total_errors: inner.total_errors,
        }
    }
}

fn ewma(current: f64, sample: f64, total_calls: u64) -> f64 {
    if total_calls <= 1 {
        sample
    } else {
        current * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA
    }
}

fn push_window(window: &mut VecDeque<bool>, error: bool) {
    if window.len() >= WINDOW_SIZE {
        window.pop_front();
    }
    window.push_back(error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_sets_latency() {
        let metrics = ProviderMetrics::new();
        metrics.record_success(120.0);

        let snap = metrics.snapshot();
        assert_eq!(snap.latency_ewma_ms, 120.0);
        assert_eq!(snap.latency_p99_ms, 120.0);
        assert_eq!(snap.total_calls, 1);
    }

    #[test]
    fn test_ewma_converges_toward_samples() {
        let metrics = ProviderMetrics::new();
        metrics.record_success(100.0);
        for _ in 0..50 {
            metrics.record_success(200.0);
        }

        let snap = metrics.snapshot();
        assert!(snap.latency_ewma_ms > 190.0);
        assert!(snap.latency_ewma_ms <= 200.0);
    }

    #[test]
    fn test_error_rate_rises_and_decays() {
        let metrics = ProviderMetrics::new();
        for _ in 0..5 {
            metrics.record_failure(50.0);
        }
        let high = metrics.snapshot().error_rate;
        assert!(high > 0.5);

        for _ in 0..20 {
            metrics.record_success(50.0);
        }
        let low = metrics.snapshot().error_rate;
        assert!(low < high / 2.0);
    }

    #[test]
    fn test_window_error_rate() {
        let metrics = ProviderMetrics::new();
        for _ in 0..4 {
            metrics.record_success(10.0);
        }
        metrics.record_failure(10.0);

        let snap = metrics.snapshot();
        assert_eq!(snap.window_error_rate, 0.2);
        assert_eq!(snap.total_errors, 1);
    }

    #[test]
    fn test_window_is_bounded() {
        let metrics = ProviderMetrics::new();
        for _ in 0..WINDOW_SIZE {
            metrics.record_failure(10.0);
        }
        for _ in 0..WINDOW_SIZE {
            metrics.record_success(10.0);
        }

        // Old failures aged out of the window entirely.
        assert_eq!(metrics.snapshot().window_error_rate, 0.0);
    }

    #[test]
    fn test_peak_decays() {
        let metrics = ProviderMetrics::new();
        metrics.record_success(1000.0);
        for _ in 0..100 {
            metrics.record_success(10.0);
        }

        let snap = metrics.snapshot();
        assert!(snap.latency_p99_ms < 1000.0);
        assert!(snap.latency_p99_ms >= 10.0);
    }
}
