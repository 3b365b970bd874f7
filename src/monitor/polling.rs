//! Generic polling monitor
//!
//! Takes the baseline snapshot synchronously in `start_run`, then polls on a
//! background thread. `stop_run` joins the thread, so no event is emitted
//! after it returns.

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::tracker::{Change, SnapshotTracker};
use super::{EventSink, Monitor};
use crate::cancel::CancellationToken;
use crate::models::{CollectObject, MonitorEvent, ResultType};

/// How often the poll thread checks for a stop request while sleeping
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Something that can be snapshotted repeatedly
pub trait SnapshotSource: Send + 'static {
    fn name(&self) -> &str;

    fn result_types(&self) -> BTreeSet<ResultType>;

    /// Current state keyed by object identity
    fn snapshot(&mut self) -> Result<BTreeMap<String, CollectObject>>;

    /// Events describing one poll cycle's changes
    fn events(&self, changes: Vec<Change<CollectObject>>) -> Vec<MonitorEvent>;
}

struct Worker<S> {
    handle: JoinHandle<S>,
    running: Arc<AtomicBool>,
}

pub struct PollingMonitor<S: SnapshotSource> {
    name: String,
    result_types: BTreeSet<ResultType>,
    interval: Duration,
    source: Option<S>,
    worker: Option<Worker<S>>,
}

impl<S: SnapshotSource> PollingMonitor<S> {
    pub fn new(source: S, interval: Duration) -> Self {
        Self {
            name: source.name().to_string(),
            result_types: source.result_types(),
            interval,
            source: Some(source),
            worker: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl<S: SnapshotSource> Monitor for PollingMonitor<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn result_types(&self) -> BTreeSet<ResultType> {
        self.result_types.clone()
    }

    fn start_run(&mut self, token: &CancellationToken, sink: EventSink) -> Result<()> {
        let mut source = self
            .source
            .take()
            .ok_or_else(|| anyhow!("Monitor {} is already running", self.name))?;

        let mut tracker = SnapshotTracker::new();
        match source.snapshot() {
            Ok(baseline) => {
                tracker.detect_changes(baseline);
            }
            Err(e) => {
                self.source = Some(source);
                return Err(e.context(format!("Failed to take baseline snapshot for {}", self.name)));
            }
        }

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let token = token.clone();
        let interval = self.interval;
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(format!("monitor-{}", self.name))
            .spawn(move || {
                let keep_going = || thread_running.load(Ordering::SeqCst) && !token.is_cancelled();

                while keep_going() {
                    let cycle_start = Instant::now();
                    while keep_going() && cycle_start.elapsed() < interval {
                        thread::sleep(STOP_CHECK_INTERVAL.min(interval));
                    }
                    if !keep_going() {
                        break;
                    }

                    match source.snapshot() {
                        Ok(snapshot) => {
                            let changes = tracker.detect_changes(snapshot);
                            for event in source.events(changes) {
                                sink(event);
                            }
                        }
                        Err(e) => log::warn!("Monitor {} poll failed: {:#}", name, e),
                    }
                }
                source
            })
            .context("Failed to spawn monitor thread")?;

        self.worker = Some(Worker { handle, running });
        Ok(())
    }

    fn stop_run(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.running.store(false, Ordering::SeqCst);
        let source = worker
            .handle
            .join()
            .map_err(|_| anyhow!("Monitor {} thread panicked", self.name))?;
        self.source = Some(source);
        Ok(())
    }
}

impl<S: SnapshotSource> Drop for PollingMonitor<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop_run() {
            log::warn!("{:#}", e);
        }
    }
}
