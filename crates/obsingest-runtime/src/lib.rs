//! Batch ingestion runtime: the worker pool, the per-file state machine and
//! the ingest report.

pub mod orchestrator;
pub mod types;

pub use orchestrator::{checksum, Orchestrator};
pub use types::*;
