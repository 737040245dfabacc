//! Feature flags
//!
//! Read from the environment and the graph at startup, mutable through the
//! operator API. Changing a flag emits `feature_flag.updated`, which the
//! materializer projects back into the graph.

use dashmap::DashMap;
use graphstore::{GraphDriver, NodeLabel, ReadQuery};
use tooling::env::get_env;

/// Materializer enablement
pub const FLAG_MATERIALIZER_ENABLED: &str = "materializer_enabled";
/// Async worker pool enablement
pub const FLAG_ASYNC_ENABLED: &str = "async_enabled";
/// Inference router enablement
pub const FLAG_ROUTER_ENABLED: &str = "router_enabled";
/// Percentage of traffic taking the canary path
pub const FLAG_CANARY_PERCENT: &str = "canary_percent";
/// LLM refinement of low-confidence intents
pub const FLAG_INTENT_REFINE_ENABLED: &str = "intent_refine_enabled";
/// Router scoring weight: latency
pub const FLAG_WEIGHT_LATENCY: &str = "router_weight_latency";
/// Router scoring weight: error rate
pub const FLAG_WEIGHT_ERROR: &str = "router_weight_error";
/// Router scoring weight: cost
pub const FLAG_WEIGHT_COST: &str = "router_weight_cost";
/// Router scoring weight: context fit
pub const FLAG_WEIGHT_CONTEXT: &str = "router_weight_context";

/// Admissible canary percentages
pub const CANARY_STEPS: [u8; 5] = [0, 1, 10, 50, 100];

const DEFAULTS: [(&str, &str); 9] = [
    (FLAG_MATERIALIZER_ENABLED, "true"),
    (FLAG_ASYNC_ENABLED, "true"),
    (FLAG_ROUTER_ENABLED, "true"),
    (FLAG_CANARY_PERCENT, "0"),
    (FLAG_INTENT_REFINE_ENABLED, "true"),
    (FLAG_WEIGHT_LATENCY, "1.0"),
    (FLAG_WEIGHT_ERROR, "2.0"),
    (FLAG_WEIGHT_COST, "0.5"),
    (FLAG_WEIGHT_CONTEXT, "1.0"),
];

/// In-memory flag store
pub struct FlagStore {
    values: DashMap<String, String>,
}

impl FlagStore {
    /// Create a store seeded with defaults.
    pub fn new() -> Self {
        let values = DashMap::new();
        for (name, value) in DEFAULTS {
            values.insert(name.to_string(), value.to_string());
        }
        Self { values }
    }

    /// Overlay values from `SYNAPSE_FLAG_<NAME>` environment variables.
    pub fn load_env(&self) {
        for (name, _) in DEFAULTS {
            let key = format!("SYNAPSE_FLAG_{}", name.to_uppercase());
            if let Ok(Some(value)) = get_env(&key) {
                self.values.insert(name.to_string(), value);
            }
        }
    }

    /// Overlay values from FeatureFlag nodes in the graph.
    ///
    /// Graph unavailability is fail-open: the store keeps its current
    /// values.
    pub async fn load_graph(&self, driver: &GraphDriver) {
        match driver.read(&ReadQuery::label(NodeLabel::FeatureFlag)).await {
            Ok(rows) => {
                for row in rows {
                    if let Some(value) = row.prop_str("value") {
                        self.values.insert(row.id.clone(), value.to_string());
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Flag load from graph skipped: {}", e);
            }
        }
    }

    /// Raw flag value.
    pub fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).map(|v| v.clone())
    }

    /// Set a flag value. The caller is responsible for emitting
    /// `feature_flag.updated`.
    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Boolean flag with default.
    pub fn bool_flag(&self, name: &str, default: bool) -> bool {
        self.get(name)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(default)
    }

    /// Float flag with default.
    pub fn f64_flag(&self, name: &str, default: f64) -> f64 {
        self.get(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Validated canary percentage; invalid values collapse to 0.
    pub fn canary_percent(&self) -> u8 {
        let value: u8 = self
            .get(FLAG_CANARY_PERCENT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if CANARY_STEPS.contains(&value) {
            value
        } else {
            tracing::warn!("Invalid canary percentage {}, using 0", value);
            0
        }
    }

    /// Whether a provider is enabled (default true).
    pub fn provider_enabled(&self, provider_id: &str) -> bool {
        self.bool_flag(&format!("provider_{}_enabled", provider_id), true)
    }

    /// All current flag values, for seeding the graph.
    pub fn all(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Default for FlagStore {
    fn default() -> Self {
        Self::new()
    }
}
