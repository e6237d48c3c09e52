//! Infrastructure layer: job stores, the transcription pipeline, the worker
//! loop and environment configuration.

pub mod config;
pub mod jobs;
pub mod pipeline;

/// Redis liveness probe.
#[cfg(feature = "redis")]
pub mod queue;

pub use config::{ConfigError, WorkerSettings};

#[cfg(test)]
mod testing;
