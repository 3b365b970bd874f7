//! Monitors observe the system while a monitoring phase runs
//!
//! A monitor starts in the background and pushes [`MonitorEvent`]s into an
//! [`EventSink`] until it is stopped. The reference monitors poll: each
//! cycle takes a snapshot and reports the difference from the previous one.

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::models::{MonitorEvent, ResultType};

pub mod filesystem;
pub mod polling;
pub mod process;
pub mod tracker;

pub use filesystem::{FileSystemMonitor, FileSystemSource};
pub use polling::{PollingMonitor, SnapshotSource};
pub use process::{ProcessMonitor, ProcessSource};
pub use tracker::{Change, SnapshotTracker};

/// Receives events from running monitors. Called from monitor threads.
pub type EventSink = Arc<dyn Fn(MonitorEvent) + Send + Sync>;

pub trait Monitor: Send {
    fn name(&self) -> &str;

    fn result_types(&self) -> BTreeSet<ResultType>;

    /// Begin observing. Must not block; events flow into `sink` until `stop_run`.
    fn start_run(&mut self, token: &CancellationToken, sink: EventSink) -> Result<()>;

    /// Stop observing. No event reaches the sink after this returns.
    fn stop_run(&mut self) -> Result<()>;
}
