//! Property-graph source of truth for synapse
//!
//! Typed nodes and edges over SQLite. All writes are idempotent upserts on
//! the primary key, wrapped in a circuit breaker so the request path can
//! treat the graph as fail-open: when the store is slow or down, callers
//! get `Unavailable` or `LegacyMode` immediately instead of blocking.

pub mod dedupe;
pub mod driver;
pub mod kv;
pub mod schema;
pub mod traversal;
pub mod types;

pub use dedupe::DedupeStore;
pub use driver::{DriverStats, GraphDriver};
pub use kv::SqliteKv;
pub use types::{EdgeRow, NodeLabel, NodeRow, ReadQuery, RelationSpec, StatusGuard, UpsertSpec};

use thiserror::Error;

/// Errors surfaced by the graph store
#[derive(Debug, Error)]
pub enum GraphError {
    /// The store could not be reached within the acquire bound
    #[error("Graph unavailable: {0}")]
    Unavailable(String),

    /// The circuit breaker is open; writes and reads fail instantly
    #[error("Graph circuit open, running in legacy mode")]
    LegacyMode,

    /// Underlying storage error
    #[error("Graph storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Property serialization error
    #[error("Graph serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    /// Whether retrying later could succeed
    pub fn retryable(&self) -> bool {
        matches!(self, GraphError::Unavailable(_) | GraphError::LegacyMode)
    }
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;
