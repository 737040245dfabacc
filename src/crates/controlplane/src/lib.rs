//! Chat control plane for synapse
//!
//! The synchronous request path and everything wired around it: rate
//! limiting, intent classification, the policy gate, provider routing with
//! fallback, asynchronous graph materialization, background workers and
//! telemetry. The operational graph is the source of truth; this crate
//! keeps serving even when the graph, the KV store or every remote
//! provider is down.

pub mod api;
pub mod config;
pub mod error;
pub mod flags;
pub mod gml;
pub mod housekeeping;
pub mod intent;
pub mod pipeline;
pub mod policy;
pub mod ratelimit;
pub mod router;
pub mod telemetry;
pub mod workers;

pub use config::AppConfig;
pub use error::{Fault, FaultKind};
pub use flags::FlagStore;
pub use pipeline::{ChatOutcome, ChatPipeline, ChatStatus, ChatTurn};
pub use router::InferenceRouter;
