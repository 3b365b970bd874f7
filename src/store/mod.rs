//! Run storage
//!
//! The [`Store`] trait is what the workflow coordinator drives. Writes are
//! queued; [`Store::pending_write_count`] exposes the backlog so the drain
//! coordinator can wait for it after a commit.

use std::path::PathBuf;

use crate::models::{CollectObject, MonitorEvent, ResultSet, Run};

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Store snapshot is not valid JSON: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("No transaction is open")]
    NoTransaction,
    #[error("A transaction is already open")]
    TransactionOpen,
    #[error("Run '{0}' not found")]
    RunNotFound(String),
    #[error("Run '{0}' already exists")]
    DuplicateRun(String),
    #[error("Commit failed: {0}")]
    Commit(String),
    #[error("Store is closed")]
    Closed,
    #[error("Failed to start store writer: {0}")]
    Worker(#[source] std::io::Error),
}

pub trait Store: Send + Sync {
    fn begin_transaction(&self) -> Result<(), StoreError>;

    /// Make runs inserted in the open transaction visible. Queued writes for
    /// those runs keep landing after commit returns.
    fn commit(&self) -> Result<(), StoreError>;

    /// Discard runs inserted in the open transaction and everything written for them
    fn rollback(&self) -> Result<(), StoreError>;

    fn write(&self, run_id: &str, object: CollectObject) -> Result<(), StoreError>;

    fn write_event(&self, run_id: &str, event: MonitorEvent) -> Result<(), StoreError>;

    /// Committed run metadata
    fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError>;

    /// Stage a run in the open transaction
    fn insert_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Stage a run that takes the place of a committed run with the same id.
    /// The old run, with its objects, events and results, stays visible until
    /// commit and survives a rollback. Returns whether a run is being replaced.
    fn replace_run(&self, run: &Run) -> Result<bool, StoreError>;

    /// Remove a committed run with its objects, events and results.
    /// Returns whether the run existed.
    fn delete_run(&self, run_id: &str) -> Result<bool, StoreError>;

    /// Committed runs, oldest first
    fn list_runs(&self) -> Result<Vec<Run>, StoreError>;

    /// Raw drift from `first` to `second`. Without `first` every object of
    /// `second` is Created against an empty base.
    fn compare(&self, first: Option<&str>, second: &str) -> Result<ResultSet, StoreError>;

    fn get_monitor_events(&self, run_id: &str) -> Result<Vec<MonitorEvent>, StoreError>;

    /// Persist classified results for a (first, second) pair, replacing earlier ones
    fn insert_results(&self, first: Option<&str>, second: &str, results: &ResultSet) -> Result<(), StoreError>;

    fn get_results(&self, first: Option<&str>, second: &str) -> Result<Option<ResultSet>, StoreError>;

    fn pending_write_count(&self) -> usize;

    fn shard_factor(&self) -> usize;

    fn close(&self) -> Result<(), StoreError>;
}
