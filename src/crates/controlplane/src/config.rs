//! Application configuration
//!
//! Loaded once from the environment at startup and passed down by handle.

use std::path::PathBuf;
use std::time::Duration;
use tooling::env::{env_or, get_env};

/// Control plane configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// SQLite URL of the graph store
    pub database_url: String,
    /// Directory for the durable event log
    pub events_dir: PathBuf,
    /// Directory for dead-lettered work items
    pub deadletter_dir: PathBuf,

    /// Whole-request deadline for `/chat`
    pub request_deadline: Duration,
    /// Budget for the intent refinement stage
    pub intent_budget: Duration,
    /// Per-provider call timeout inside the router
    pub provider_timeout: Duration,
    /// Extra fallback attempts after the first candidate
    pub max_fallbacks: usize,

    /// Freshness window separating `live` from `stale` layers
    pub staleness_window: Duration,
    /// Per-task timeout in the worker pool
    pub task_timeout: Duration,
    /// Worker heartbeat interval
    pub heartbeat_interval: Duration,
    /// Broker reachability probe bound
    pub broker_probe_timeout: Duration,

    /// Artifact retention age in days (seed for the RetentionPolicy node)
    pub artifact_max_age_days: u32,
    /// Pending approvals expire after this many seconds
    pub approval_ttl: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite:synapse.db".to_string(),
            events_dir: PathBuf::from("events"),
            deadletter_dir: PathBuf::from("deadletter"),
            request_deadline: Duration::from_secs(20),
            intent_budget: Duration::from_millis(1500),
            provider_timeout: Duration::from_secs(10),
            max_fallbacks: 3,
            staleness_window: Duration::from_secs(300),
            task_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            broker_probe_timeout: Duration::from_millis(200),
            artifact_max_age_days: 30,
            approval_ttl: Duration::from_secs(3600),
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: get_env("HOST").ok().flatten().unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            database_url: get_env("DATABASE_URL")
                .ok()
                .flatten()
                .unwrap_or(defaults.database_url),
            events_dir: get_env("EVENTS_DIR")
                .ok()
                .flatten()
                .map(PathBuf::from)
                .unwrap_or(defaults.events_dir),
            deadletter_dir: get_env("DEADLETTER_DIR")
                .ok()
                .flatten()
                .map(PathBuf::from)
                .unwrap_or(defaults.deadletter_dir),
            request_deadline: Duration::from_millis(env_or(
                "REQUEST_DEADLINE_MS",
                defaults.request_deadline.as_millis() as u64,
            )),
            intent_budget: Duration::from_millis(env_or(
                "INTENT_BUDGET_MS",
                defaults.intent_budget.as_millis() as u64,
            )),
            provider_timeout: Duration::from_millis(env_or(
                "PROVIDER_TIMEOUT_MS",
                defaults.provider_timeout.as_millis() as u64,
            )),
            max_fallbacks: env_or("MAX_FALLBACKS", defaults.max_fallbacks),
            staleness_window: Duration::from_secs(env_or(
                "STALENESS_WINDOW_SECS",
                defaults.staleness_window.as_secs(),
            )),
            task_timeout: Duration::from_secs(env_or(
                "TASK_TIMEOUT_SECS",
                defaults.task_timeout.as_secs(),
            )),
            heartbeat_interval: Duration::from_secs(env_or(
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )),
            broker_probe_timeout: Duration::from_millis(env_or(
                "BROKER_PROBE_TIMEOUT_MS",
                defaults.broker_probe_timeout.as_millis() as u64,
            )),
            artifact_max_age_days: env_or("ARTIFACT_MAX_AGE_DAYS", defaults.artifact_max_age_days),
            approval_ttl: Duration::from_secs(env_or(
                "APPROVAL_TTL_SECS",
                defaults.approval_ttl.as_secs(),
            )),
        }
    }
}
