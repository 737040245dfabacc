//! HTTP and WebSocket API
//!
//! Route definitions, request handlers and the realtime event stream.

pub mod handlers;
pub mod routes;
pub mod ws;

pub use routes::{create_router, AppState};
