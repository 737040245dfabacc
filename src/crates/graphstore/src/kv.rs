//! Shared key-value table
//!
//! TTL'd string keys over the graph pool. The rate limiter keeps its
//! bucket state here so that restarts and sibling processes see the same
//! counters; on any error callers fall back to process-local state.

use crate::{GraphError, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::Row;
use std::time::Duration;

/// TTL'd key-value store over SQLite
#[derive(Clone)]
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    /// Wrap a pool whose schema already contains the kv table.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Read a key, honoring expiry.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value, expires_ts FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(GraphError::Storage)?;

        Ok(row.and_then(|row| {
            let expires: Option<i64> = row.get(1);
            match expires {
                Some(ts) if ts <= Utc::now().timestamp_millis() => None,
                _ => Some(row.get(0)),
            }
        }))
    }

    /// Write a key with an optional time-to-live.
    pub async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires = ttl.map(|d| Utc::now().timestamp_millis() + d.as_millis() as i64);
        sqlx::query(
            "INSERT INTO kv (key, value, expires_ts) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_ts = excluded.expires_ts",
        )
        .bind(key)
        .bind(value)
        .bind(expires)
        .execute(&self.pool)
        .await
        .map_err(GraphError::Storage)?;
        Ok(())
    }

    /// Delete a key.
    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(GraphError::Storage)?;
        Ok(())
    }

    /// Drop expired rows, returning how many were removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv WHERE expires_ts IS NOT NULL AND expires_ts <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(GraphError::Storage)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::init_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_kv() -> SqliteKv {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        SqliteKv::new(pool)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let kv = memory_kv().await;

        kv.put("k", "v", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_overwrite() {
        let kv = memory_kv().await;

        kv.put("k", "v1", None).await.unwrap();
        kv.put("k", "v2", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_expired_key_not_returned() {
        let kv = memory_kv().await;

        kv.put("k", "v", Some(Duration::ZERO)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let kv = memory_kv().await;

        kv.put("gone", "v", Some(Duration::ZERO)).await.unwrap();
        kv.put("kept", "v", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(kv.purge_expired().await.unwrap(), 1);
        assert_eq!(kv.get("kept").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_delete() {
        let kv = memory_kv().await;

        kv.put("k", "v", None).await.unwrap();
        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
