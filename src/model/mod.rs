//! Model preparation: from a configured source to a servable GGUF file.
//!
//! - [`spec`]: What to serve (source, identifier, quantization level)
//! - [`artifact`]: Prepared artifacts and the on-disk naming contract
//! - [`sources`]: Model hub and object store clients
//! - [`resolver`]: Finds or downloads the model, decides whether it needs conversion
//! - [`converter`]: Runs the external conversion and quantization tools

pub mod artifact;
pub mod converter;
pub mod resolver;
pub mod sources;
pub mod spec;
