//! Graph driver: pooled, circuit-broken access to the SSoT
//!
//! One upsert-and-relate write path and one parameterized read path.
//! Connection acquisition is bounded; repeated failures open the circuit
//! and subsequent calls fail instantly with `LegacyMode` until the
//! cooldown elapses. Callers treat every error here as fail-open.

use crate::schema::init_schema;
use crate::types::{EdgeRow, NodeLabel, NodeRow, ReadQuery, UpsertSpec};
use crate::{GraphError, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tooling::breaker::{BreakerState, CircuitBreaker};

/// Bounded wait for a pooled connection
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive failures before the circuit opens
pub const BREAKER_THRESHOLD: u32 = 5;

/// How long the circuit stays open
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Point-in-time driver statistics
#[derive(Debug, Clone)]
pub struct DriverStats {
    /// Successful writes
    pub writes_total: u64,
    /// Failed writes (storage or availability)
    pub write_failures: u64,
    /// Successful reads
    pub reads_total: u64,
    /// Failed reads
    pub read_failures: u64,
    /// Merges skipped by a status guard
    pub guard_skips: u64,
    /// Calls rejected while the circuit was open
    pub legacy_rejections: u64,
    /// Current breaker state
    pub breaker_state: BreakerState,
}

/// Pooled, circuit-broken graph driver
pub struct GraphDriver {
    pool: SqlitePool,
    breaker: CircuitBreaker,
    writes: AtomicU64,
    write_failures: AtomicU64,
    reads: AtomicU64,
    read_failures: AtomicU64,
    guard_skips: AtomicU64,
    legacy_rejections: AtomicU64,
}

impl GraphDriver {
    /// Connect to the store and initialize the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_max_connections(database_url, 5).await
    }

    /// Connect with a custom pool size.
    pub async fn connect_with_max_connections(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(map_sqlx)?;

        init_schema(&pool).await?;

        Ok(Self {
            pool,
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN),
            writes: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            guard_skips: AtomicU64::new(0),
            legacy_rejections: AtomicU64::new(0),
        })
    }

    /// The underlying pool, shared with the dedupe and KV stores.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent upsert-and-relate.
    ///
    /// Merges `spec.props` over the stored properties of `(label, id)` and
    /// upserts every relation. Replaying the same spec converges to the
    /// same state. When a status guard rejects the transition the write is
    /// a counted no-op.
    pub async fn upsert(&self, spec: &UpsertSpec) -> Result<()> {
        if !self.breaker.allow() {
            self.legacy_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(GraphError::LegacyMode);
        }

        match self.do_upsert(spec).await {
            Ok(applied) => {
                self.breaker.record_success();
                if applied {
                    self.writes.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.guard_skips.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                self.write_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn do_upsert(&self, spec: &UpsertSpec) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let stored: Option<String> =
            sqlx::query("SELECT props_json FROM nodes WHERE label = ? AND id = ?")
                .bind(spec.label.as_str())
                .bind(&spec.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx)?
                .map(|row| row.get(0));

        let stored: Value = match stored {
            Some(text) => serde_json::from_str(&text).unwrap_or_else(|_| Value::Object(Default::default())),
            None => Value::Object(Default::default()),
        };

        if let Some(guard) = &spec.guard {
            let current = stored.get(guard.field.as_str()).and_then(|v| v.as_str());
            let incoming = spec.props.get(guard.field.as_str()).and_then(|v| v.as_str());
            if !guard.admits(current, incoming) {
                tracing::debug!(
                    "Guard skipped {}:{} ({:?} -> {:?})",
                    spec.label,
                    spec.id,
                    current,
                    incoming
                );
                tx.rollback().await.map_err(map_sqlx)?;
                return Ok(false);
            }
        }

        let merged = merge_props(stored, &spec.props);
        let merged_text = serde_json::to_string(&merged)?;

        sqlx::query(
            "INSERT INTO nodes (label, id, props_json, updated_ts) VALUES (?, ?, ?, ?)
             ON CONFLICT(label, id) DO UPDATE SET
                 props_json = excluded.props_json,
                 updated_ts = excluded.updated_ts",
        )
        .bind(spec.label.as_str())
        .bind(&spec.id)
        .bind(&merged_text)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        for relation in &spec.relations {
            let props_text = serde_json::to_string(&relation.props)?;
            sqlx::query(
                "INSERT INTO edges (src_label, src_id, rel, dst_label, dst_id, props_json, updated_ts)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(src_label, src_id, rel, dst_label, dst_id) DO UPDATE SET
                     props_json = excluded.props_json,
                     updated_ts = excluded.updated_ts",
            )
            .bind(relation.src.0.as_str())
            .bind(&relation.src.1)
            .bind(&relation.rel)
            .bind(relation.dst.0.as_str())
            .bind(&relation.dst.1)
            .bind(&props_text)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(true)
    }

    /// Parameterized node read.
    pub async fn read(&self, query: &ReadQuery) -> Result<Vec<NodeRow>> {
        if !self.breaker.allow() {
            self.legacy_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(GraphError::LegacyMode);
        }

        let result = self.do_read(query).await;
        match &result {
            Ok(_) => {
                self.breaker.record_success();
                self.reads.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.breaker.record_failure();
                self.read_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn do_read(&self, query: &ReadQuery) -> Result<Vec<NodeRow>> {
        let rows = sqlx::query("SELECT label, id, props_json, updated_ts FROM nodes WHERE label = ?")
            .bind(query.label.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get(1);
            if let Some(ids) = &query.ids {
                if !ids.contains(&id) {
                    continue;
                }
            }

            let props: Value = serde_json::from_str(row.get::<String, _>(2).as_str())
                .unwrap_or_else(|_| Value::Object(Default::default()));

            if !query
                .prop_equals
                .iter()
                .all(|(key, value)| props.get(key) == Some(value))
            {
                continue;
            }

            out.push(NodeRow {
                label: query.label,
                id,
                props,
                updated_ts: row.get(3),
            });

            if let Some(limit) = query.limit {
                if out.len() >= limit {
                    break;
                }
            }
        }

        Ok(out)
    }

    /// Read a single node.
    pub async fn get_node(&self, label: NodeLabel, id: &str) -> Result<Option<NodeRow>> {
        let rows = self
            .read(&ReadQuery::label(label).with_ids(vec![id.to_string()]))
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Read edges leaving a node, optionally filtered by relation name.
    pub async fn read_edges(
        &self,
        src_label: NodeLabel,
        src_id: &str,
        rel: Option<&str>,
    ) -> Result<Vec<EdgeRow>> {
        if !self.breaker.allow() {
            self.legacy_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(GraphError::LegacyMode);
        }

        let rows = sqlx::query(
            "SELECT src_label, src_id, rel, dst_label, dst_id, props_json
             FROM edges WHERE src_label = ? AND src_id = ?",
        )
        .bind(src_label.as_str())
        .bind(src_id)
        .fetch_all(&self.pool)
        .await;

        let rows = match rows {
            Ok(rows) => {
                self.breaker.record_success();
                rows
            }
            Err(e) => {
                self.breaker.record_failure();
                self.read_failures.fetch_add(1, Ordering::Relaxed);
                return Err(map_sqlx(e));
            }
        };

        let mut out = Vec::new();
        for row in rows {
            let rel_name: String = row.get(2);
            if let Some(want) = rel {
                if rel_name != want {
                    continue;
                }
            }
            let src_label = match NodeLabel::from_name(row.get::<String, _>(0).as_str()) {
                Some(label) => label,
                None => continue,
            };
            let dst_label = match NodeLabel::from_name(row.get::<String, _>(3).as_str()) {
                Some(label) => label,
                None => continue,
            };
            out.push(EdgeRow {
                src: (src_label, row.get(1)),
                rel: rel_name,
                dst: (dst_label, row.get(4)),
                props: serde_json::from_str(row.get::<String, _>(5).as_str())
                    .unwrap_or_else(|_| Value::Object(Default::default())),
            });
        }

        Ok(out)
    }

    /// Stamp a freshness layer with the current time.
    pub async fn touch_layer(&self, layer: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO layer_freshness (layer, last_update_ts) VALUES (?, ?)
             ON CONFLICT(layer) DO UPDATE SET last_update_ts = excluded.last_update_ts",
        )
        .bind(layer)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    /// All stamped freshness layers with their last update (epoch millis).
    pub async fn layers(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query("SELECT layer, last_update_ts FROM layer_freshness")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect())
    }

    /// Current breaker state.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Snapshot of driver counters.
    pub fn stats(&self) -> DriverStats {
        DriverStats {
            writes_total: self.writes.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            reads_total: self.reads.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            guard_skips: self.guard_skips.load(Ordering::Relaxed),
            legacy_rejections: self.legacy_rejections.load(Ordering::Relaxed),
            breaker_state: self.breaker.state(),
        }
    }
}

/// Shallow-merge incoming properties over stored ones.
fn merge_props(stored: Value, incoming: &Value) -> Value {
    let mut base = match stored {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    if let Value::Object(incoming) = incoming {
        for (key, value) in incoming {
            base.insert(key.clone(), value.clone());
        }
    }
    Value::Object(base)
}

fn map_sqlx(e: sqlx::Error) -> GraphError {
    match e {
        sqlx::Error::PoolTimedOut => {
            GraphError::Unavailable("connection acquire timed out".to_string())
        }
        sqlx::Error::PoolClosed => GraphError::Unavailable("pool closed".to_string()),
        other => GraphError::Storage(other),
    }
}
