//! Logging initialization and helpers
//!
//! Structured logging with tracing, filtered by `RUST_LOG`.

use std::time::Instant;
use tracing::debug;

/// Initialize the global tracing subscriber.
///
/// Reads the filter from `RUST_LOG`, defaulting to `info`. Safe to call
/// once per process; later calls are ignored.
pub fn init() {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(rust_log)
        .try_init();
}

/// Log execution time of an async operation at debug level.
pub async fn timed<F, T>(name: &str, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = future.await;
    debug!("{} completed in {:?}", name, start.elapsed());
    result
}
