//! HTTP server fronting the inference engine.
//!
//! - [`router`]: Routes, handlers and shared state
//! - [`dialect`]: Inbound request dialects and validation
//! - [`proxy`]: Streaming forwarder to the engine
//! - [`error`]: Per-request errors and their JSON rendering
//! - [`metrics`]: Prometheus counters

pub mod dialect;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod router;
