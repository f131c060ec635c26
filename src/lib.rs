// src/lib.rs
// Public library surface for the `atlas` binary and integration tests.

pub mod config;
pub mod error;
pub mod store;
pub mod status;

// Pipeline stages
pub mod ingest;
pub mod score;
pub mod scheduler;

// Serving & operations
pub mod dashboard;
pub mod metrics;
pub mod supervisor;
pub mod launchd;
pub mod doctor;
pub mod backup;

// ---- Re-exports for stable public API ----
pub use crate::config::AtlasConfig;
pub use crate::error::{AtlasError, Result};
pub use crate::store::{ColorToken, InsertOutcome, NewSignal, Signal, Store};

/// Tracing targets used by the stages; `info` for these, `warn` for everything else.
pub const DEFAULT_LOG_FILTER: &str = "signal_atlas=info,store=info,ingest=info,score=info,\
scheduler=info,dashboard=info,supervisor=info,launchd=info,doctor=info,backup=info,warn";
