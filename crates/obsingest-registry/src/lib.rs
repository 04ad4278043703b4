//! Transactional dimension and exposure catalog with foreign-key enforcement.

pub mod client;
pub mod schema;
pub mod sqlite;

pub use client::{ExposureInsert, RegistryClient, RegistryTransaction, SyncOutcome};
pub use sqlite::{RegistryStats, SqliteRegistry, SqliteTransaction};
