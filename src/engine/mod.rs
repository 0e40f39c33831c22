//! Inference engine lifecycle.
//!
//! - [`process`]: The engine child process and its capability trait
//! - [`supervisor`]: Startup health polling, state publication and crash monitoring

pub mod process;
pub mod supervisor;
