//! llama-adapter: serve a GGUF model through a supervised llama-server.
//!
//! On first boot the adapter resolves the configured model (hub repository,
//! object store prefix or local path), converts and quantizes it when only raw
//! weights are available, launches `llama-server` on an internal port and waits
//! for it to become healthy. It then proxies OpenAI-style and `/invocations`
//! requests to the engine, streaming responses through unchanged.

pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod model;
pub mod server;
