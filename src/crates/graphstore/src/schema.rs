//! Graph schema bootstrap
//!
//! Creates the node, edge, dedupe, KV and layer-freshness tables. All
//! statements are idempotent so startup can run them unconditionally.

use crate::Result;
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS nodes (
        label       TEXT NOT NULL,
        id          TEXT NOT NULL,
        props_json  TEXT NOT NULL DEFAULT '{}',
        updated_ts  INTEGER NOT NULL,
        PRIMARY KEY (label, id)
    )",
    "CREATE TABLE IF NOT EXISTS edges (
        src_label   TEXT NOT NULL,
        src_id      TEXT NOT NULL,
        rel         TEXT NOT NULL,
        dst_label   TEXT NOT NULL,
        dst_id      TEXT NOT NULL,
        props_json  TEXT NOT NULL DEFAULT '{}',
        updated_ts  INTEGER NOT NULL,
        PRIMARY KEY (src_label, src_id, rel, dst_label, dst_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_edges_src ON edges (src_label, src_id)",
    "CREATE TABLE IF NOT EXISTS mutation_dedupe (
        mutation_id TEXT PRIMARY KEY,
        inserted_ts INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS kv (
        key         TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        expires_ts  INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS layer_freshness (
        layer           TEXT PRIMARY KEY,
        last_update_ts  INTEGER NOT NULL
    )",
];

/// Create all tables and indexes if they do not exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_init_schema_idempotent() {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();

        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}
