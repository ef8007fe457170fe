//! The ledger: persistent per-item sync state.
//!
//! Maps each remote media item id to its status and local path, so reruns
//! skip what is already on disk and pick up where an interrupted run stopped.
//! Backed by SQLite in WAL mode; every write is a single statement.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{Ledger, SqliteLedger};
pub use error::StateError;
pub use types::{LedgerSummary, SyncRecord, SyncRunStats, SyncStatus};
