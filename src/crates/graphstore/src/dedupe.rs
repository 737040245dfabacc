//! Mutation dedupe store
//!
//! A small persistent key set that makes graph materialization idempotent.
//! A mutation id is inserted only after its graph write succeeds, so a
//! replayed event either hits the set (already applied) or re-attempts the
//! same idempotent upsert.

use crate::{GraphError, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::Row;

/// Persistent set of applied mutation ids
#[derive(Clone)]
pub struct DedupeStore {
    pool: SqlitePool,
}

impl DedupeStore {
    /// Wrap a pool whose schema already contains the dedupe table.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Whether a mutation id has already been applied.
    pub async fn contains(&self, mutation_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM mutation_dedupe WHERE mutation_id = ?")
            .bind(mutation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(GraphError::Storage)?;
        Ok(row.is_some())
    }

    /// Record a mutation id as applied.
    pub async fn insert(&self, mutation_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO mutation_dedupe (mutation_id, inserted_ts) VALUES (?, ?)
             ON CONFLICT(mutation_id) DO NOTHING",
        )
        .bind(mutation_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(GraphError::Storage)?;
        Ok(())
    }

    /// Remove entries older than `max_age_ms`, returning how many were
    /// pruned.
    pub async fn prune_older_than(&self, max_age_ms: i64) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - max_age_ms;
        let result = sqlx::query("DELETE FROM mutation_dedupe WHERE inserted_ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(GraphError::Storage)?;
        Ok(result.rows_affected())
    }

    /// Number of entries currently held.
    pub async fn len(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) FROM mutation_dedupe")
            .fetch_one(&self.pool)
            .await
            .map_err(GraphError::Storage)?;
        Ok(row.get::<i64, _>(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::init_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> DedupeStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        DedupeStore::new(pool)
    }

    #[tokio::test]
    async fn test_insert_and_contains() {
        let store = memory_store().await;

        assert!(!store.contains("m1").await.unwrap());
        store.insert("m1").await.unwrap();
        assert!(store.contains("m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_double_insert_is_noop() {
        let store = memory_store().await;

        store.insert("m1").await.unwrap();
        store.insert("m1").await.unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prune_old_entries() {
        let store = memory_store().await;

        store.insert("m1").await.unwrap();
        // Everything younger than a day stays.
        assert_eq!(store.prune_older_than(86_400_000).await.unwrap(), 0);
        // A cutoff in the future removes it.
        assert_eq!(store.prune_older_than(-1000).await.unwrap(), 1);
        assert!(!store.contains("m1").await.unwrap());
    }
}
