//! Per-torrent match pipeline.
//!
//! Drives one local torrent through gate, search, match, reconcile, inject
//! and verify, emitting structured outcome records along the way.

mod runner;
mod types;

pub use runner::MatchPipeline;
pub use types::{
    JobEntry, JobRegistry, PipelineConfig, PipelineRunResult, PipelineState, RunOutcome,
};
