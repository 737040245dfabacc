//! Payload redaction and hashing
//!
//! Strips denied keys, replaces over-long strings with SHA-256 digests plus
//! length metadata, and counts everything it removes. Applied twice on every
//! data path: once when an event is published and once when the payload is
//! written to the graph.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum stored string length for graph writes.
pub const MAX_STR_LEN_GRAPH: usize = 512;

/// Maximum stored string length for the durable event log.
pub const MAX_STR_LEN_LOG: usize = 2048;

/// Property names never allowed in events or graph writes.
pub const DENIED_KEYS: [&str; 10] = [
    "prompt",
    "html",
    "snippet",
    "content",
    "authorization",
    "token",
    "api_key",
    "secret",
    "cookie",
    "session",
];

/// Check whether a key is in the denied set (case-insensitive).
pub fn is_denied_key(key: &str) -> bool {
    DENIED_KEYS.iter().any(|k| key.eq_ignore_ascii_case(k))
}

/// Hex-encoded SHA-256 of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Derive a deterministic identifier from an ordered list of parts.
///
/// Parts are joined with a `:` separator before hashing, so
/// `derive_id(&["a", "b"])` is stable across processes and replays.
pub fn derive_id(parts: &[&str]) -> String {
    sha256_hex(parts.join(":").as_bytes())
}

/// Counters exposed by a redaction boundary.
///
/// Each boundary (event publish, graph upsert) owns one set of counters so
/// telemetry can tell the two apart.
#[derive(Debug, Default)]
pub struct RedactionCounters {
    denied_key_dropped: AtomicU64,
    string_truncated: AtomicU64,
}

impl RedactionCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys dropped because they were in the denied set.
    pub fn denied_key_dropped(&self) -> u64 {
        self.denied_key_dropped.load(Ordering::Relaxed)
    }

    /// Strings replaced by hash metadata.
    pub fn string_truncated(&self) -> u64 {
        self.string_truncated.load(Ordering::Relaxed)
    }
}

/// Redact a JSON value in depth.
///
/// Denied keys are dropped recursively. String values longer than
/// `max_str_len` bytes are replaced with
/// `{"_redacted": true, "hash": <sha256>, "len": <bytes>}`. Numbers,
/// booleans, nulls and short strings pass through untouched. The original
/// value is consumed and never logged.
pub fn redact_value(value: Value, max_str_len: usize, counters: &RedactionCounters) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                if is_denied_key(&key) {
                    counters.denied_key_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                out.insert(key, redact_value(val, max_str_len, counters));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| redact_value(v, max_str_len, counters))
                .collect(),
        ),
        Value::String(s) if s.len() > max_str_len => {
            counters.string_truncated.fetch_add(1, Ordering::Relaxed);
            json!({
                "_redacted": true,
                "hash": sha256_hex(s.as_bytes()),
                "len": s.len(),
            })
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_key_dropped() {
        let counters = RedactionCounters::new();
        let value = json!({"prompt": "secret text", "x": 1});
        let out = redact_value(value, MAX_STR_LEN_GRAPH, &counters);

        assert_eq!(out, json!({"x": 1}));
        assert_eq!(counters.denied_key_dropped(), 1);
        assert_eq!(counters.string_truncated(), 0);
    }

    #[test]
    fn test_denied_key_case_insensitive() {
        let counters = RedactionCounters::new();
        let value = json!({"Authorization": "Bearer abc", "API_KEY": "k"});
        let out = redact_value(value, MAX_STR_LEN_GRAPH, &counters);

        assert_eq!(out, json!({}));
        assert_eq!(counters.denied_key_dropped(), 2);
    }

    #[test]
    fn test_denied_key_dropped_recursively() {
        let counters = RedactionCounters::new();
        let value = json!({"outer": {"cookie": "c=1", "keep": true}, "list": [{"secret": "s"}]});
        let out = redact_value(value, MAX_STR_LEN_GRAPH, &counters);

        assert_eq!(out, json!({"outer": {"keep": true}, "list": [{}]}));
        assert_eq!(counters.denied_key_dropped(), 2);
    }

    #[test]
    fn test_string_at_limit_kept_verbatim() {
        let counters = RedactionCounters::new();
        let exact = "a".repeat(MAX_STR_LEN_GRAPH);
        let out = redact_value(json!({ "v": exact.clone() }), MAX_STR_LEN_GRAPH, &counters);

        assert_eq!(out, json!({ "v": exact }));
        assert_eq!(counters.string_truncated(), 0);
    }

    #[test]
    fn test_string_over_limit_hashed() {
        let counters = RedactionCounters::new();
        let long = "a".repeat(MAX_STR_LEN_GRAPH + 1);
        let out = redact_value(json!({ "v": long.clone() }), MAX_STR_LEN_GRAPH, &counters);

        let v = &out["v"];
        assert_eq!(v["_redacted"], json!(true));
        assert_eq!(v["hash"], json!(sha256_hex(long.as_bytes())));
        assert_eq!(v["len"], json!(MAX_STR_LEN_GRAPH + 1));
        assert_eq!(counters.string_truncated(), 1);
    }

    #[test]
    fn test_scalars_untouched() {
        let counters = RedactionCounters::new();
        let value = json!({"n": 42, "f": 1.5, "b": false, "nil": null, "s": "short"});
        let out = redact_value(value.clone(), MAX_STR_LEN_GRAPH, &counters);

        assert_eq!(out, value);
        assert_eq!(counters.denied_key_dropped(), 0);
        assert_eq!(counters.string_truncated(), 0);
    }

    #[test]
    fn test_original_absent_from_output() {
        let counters = RedactionCounters::new();
        let long = format!("classified-{}", "x".repeat(MAX_STR_LEN_LOG));
        let out = redact_value(json!({ "body": long }), MAX_STR_LEN_LOG, &counters);

        assert!(!out.to_string().contains("classified"));
    }

    #[test]
    fn test_sha256_hex_stable() {
        assert_eq!(sha256_hex(b"hello"), sha256_hex(b"hello"));
        assert_ne!(sha256_hex(b"hello"), sha256_hex(b"world"));
        assert_eq!(sha256_hex(b"hello").len(), 64);
    }

    #[test]
    fn test_derive_id_deterministic() {
        let a = derive_id(&["conv-1", "turn-3"]);
        let b = derive_id(&["conv-1", "turn-3"]);
        let c = derive_id(&["conv-1", "turn-4"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
