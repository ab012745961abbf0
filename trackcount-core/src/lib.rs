pub mod config;
pub mod counting;
pub mod detection;
pub mod display;
pub mod pipeline;
pub mod rendering;
pub mod runtime;
pub mod snapshot;
pub mod tracking;
pub mod video;

// Re-export the top-level pipeline error type so callers only need `trackcount_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;

pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{FfmpegBackend, Pipeline, PipelineState, RunSummary, StopReason};
