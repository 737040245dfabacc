//! Event envelope, bus and durable log for synapse
//!
//! Everything that happens in the control plane is described by an
//! `event_v1` envelope. This crate owns the envelope type, the in-process
//! fan-out bus with bounded per-subscriber queues, and the append-only
//! JSONL log that makes replay possible.

pub mod bus;
pub mod envelope;
pub mod log;

pub use bus::{BusStats, EventBus, Subscription};
pub use envelope::{Event, EventDraft, EventKind, SCHEMA_VERSION};
pub use log::{EventLog, LogPosition};

use thiserror::Error;

/// Errors that can occur in the events crate
#[derive(Debug, Error)]
pub enum EventError {
    /// I/O error on the durable log
    #[error("Event log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope serialization error
    #[error("Envelope serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for event operations
pub type Result<T> = std::result::Result<T, EventError>;
