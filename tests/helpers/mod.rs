#![allow(dead_code)]

//! In-memory fakes shared by the integration tests

use anyhow::bail;
use chrono::Utc;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use driftscan::cancel::CancellationToken;
use driftscan::collectors::Collector;
use driftscan::drain::DrainSettings;
use driftscan::export::{ExportContext, Exporter};
use driftscan::models::{
    ChangeType, CollectObject, FileSystemEvent, GenericEvent, MonitorEvent, ResultSet, ResultType, Run,
};
use driftscan::monitor::{EventSink, Monitor};
use driftscan::observer::{DrainProgress, Phase, PhaseObserver, PhaseOutcome};
use driftscan::store::{MemoryStore, Store, StoreError};
use driftscan::workflow::{ScanCoordinator, WorkflowState};

pub fn file(path: &str) -> CollectObject {
    CollectObject::new(ResultType::File, path)
        .with_attribute("path", path)
        .with_attribute("size", 1)
        .with_attribute("is_directory", false)
        .with_attribute("is_executable", false)
}

pub fn process(pid: u32, name: &str) -> CollectObject {
    CollectObject::new(ResultType::Process, format!("{}:1", pid))
        .with_attribute("pid", pid)
        .with_attribute("name", name)
}

pub fn file_event(change_type: ChangeType, path: &str) -> MonitorEvent {
    MonitorEvent::FileSystem(FileSystemEvent {
        change_type,
        path: path.to_string(),
        old_path: None,
        timestamp: Utc::now(),
        snapshot: Some(file(path)),
    })
}

pub fn process_event(change_type: ChangeType, pid: u32) -> MonitorEvent {
    let object = process(pid, "worker");
    MonitorEvent::Generic(GenericEvent {
        result_type: ResultType::Process,
        change_type,
        identity: object.identity,
        attributes: object.attributes,
        timestamp: Utc::now(),
    })
}

/// Emits one batch per run, repeating the last batch
pub struct FakeCollector {
    name: String,
    result_types: BTreeSet<ResultType>,
    batches: VecDeque<Vec<CollectObject>>,
    last: Vec<CollectObject>,
    pub runs: Arc<AtomicUsize>,
}

impl FakeCollector {
    pub fn new(name: &str, batches: Vec<Vec<CollectObject>>) -> Self {
        let result_types = batches.iter().flatten().map(|o| o.result_type).collect();
        Self {
            name: name.to_string(),
            result_types,
            batches: batches.into(),
            last: Vec::new(),
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Collector for FakeCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn result_types(&self) -> BTreeSet<ResultType> {
        self.result_types.clone()
    }

    fn start_run(&mut self, _token: &CancellationToken, sink: &mut dyn FnMut(CollectObject)) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(batch) = self.batches.pop_front() {
            self.last = batch;
        }
        for object in &self.last {
            sink(object.clone());
        }
        Ok(())
    }
}

/// Emits some objects, then faults
pub struct FailingCollector;

impl Collector for FailingCollector {
    fn name(&self) -> &str {
        "failing"
    }

    fn result_types(&self) -> BTreeSet<ResultType> {
        BTreeSet::from([ResultType::Port])
    }

    fn start_run(&mut self, _token: &CancellationToken, sink: &mut dyn FnMut(CollectObject)) -> anyhow::Result<()> {
        sink(CollectObject::new(ResultType::Port, "tcp:22"));
        bail!("port table unavailable")
    }
}

/// Emits its objects, then cancels the token as if the user pressed Ctrl+C twice
pub struct CancellingCollector {
    pub token: CancellationToken,
    pub objects: Vec<CollectObject>,
}

impl Collector for CancellingCollector {
    fn name(&self) -> &str {
        "cancelling"
    }

    fn result_types(&self) -> BTreeSet<ResultType> {
        BTreeSet::from([ResultType::File])
    }

    fn start_run(&mut self, token: &CancellationToken, sink: &mut dyn FnMut(CollectObject)) -> anyhow::Result<()> {
        for object in &self.objects {
            sink(object.clone());
        }
        self.token.cancel();
        assert!(token.is_cancelled());
        Ok(())
    }
}

/// Emits its events as soon as it starts; refuses to emit after stop
pub struct FakeMonitor {
    events: Vec<MonitorEvent>,
    sink: Option<EventSink>,
    pub stopped: Arc<AtomicBool>,
}

impl FakeMonitor {
    pub fn new(events: Vec<MonitorEvent>) -> Self {
        Self {
            events,
            sink: None,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Monitor for FakeMonitor {
    fn name(&self) -> &str {
        "fake-monitor"
    }

    fn result_types(&self) -> BTreeSet<ResultType> {
        self.events.iter().map(|e| e.result_type()).collect()
    }

    fn start_run(&mut self, _token: &CancellationToken, sink: EventSink) -> anyhow::Result<()> {
        self.stopped.store(false, Ordering::SeqCst);
        for event in &self.events {
            sink(event.clone());
        }
        self.sink = Some(sink);
        Ok(())
    }

    fn stop_run(&mut self) -> anyhow::Result<()> {
        self.sink = None;
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FailingMonitor;

impl Monitor for FailingMonitor {
    fn name(&self) -> &str {
        "failing-monitor"
    }

    fn result_types(&self) -> BTreeSet<ResultType> {
        BTreeSet::from([ResultType::FileMonitor])
    }

    fn start_run(&mut self, _token: &CancellationToken, _sink: EventSink) -> anyhow::Result<()> {
        bail!("watch limit reached")
    }

    fn stop_run(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records every observer callback as a short string
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<String>>,
    pub advisories: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<DrainProgress>>,
    pub states: Mutex<Vec<WorkflowState>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn advisory_count(&self) -> usize {
        self.advisories.lock().unwrap().len()
    }
}

impl PhaseObserver for RecordingObserver {
    fn on_phase_start(&self, phase: Phase, run_id: &str) {
        self.events.lock().unwrap().push(format!("start {} {}", phase, run_id));
    }

    fn on_phase_end(&self, phase: Phase, run_id: &str, outcome: &PhaseOutcome) {
        let outcome = match outcome {
            PhaseOutcome::Completed => "completed",
            PhaseOutcome::Skipped(_) => "skipped",
            PhaseOutcome::Cancelled => "cancelled",
            PhaseOutcome::Failed(_) => "failed",
        };
        self.events.lock().unwrap().push(format!("end {} {} {}", phase, run_id, outcome));
    }

    fn on_progress(&self, _run_id: &str, progress: &DrainProgress) {
        self.progress.lock().unwrap().push(progress.clone());
    }

    fn on_advisory(&self, message: &str) {
        self.advisories.lock().unwrap().push(message.to_string());
    }

    fn on_state_change(&self, _from: WorkflowState, to: WorkflowState) {
        self.states.lock().unwrap().push(to);
    }
}

/// Keeps what it was asked to export instead of writing files
#[derive(Default)]
pub struct RecordingExporter {
    pub exports: Mutex<Vec<(ExportContext, ResultSet)>>,
}

impl Exporter for RecordingExporter {
    fn export(&self, context: &ExportContext, results: &ResultSet) -> anyhow::Result<Vec<PathBuf>> {
        self.exports.lock().unwrap().push((context.clone(), results.clone()));
        Ok(vec![context.output_dir.join(format!("{}_results.json.txt", context.file_stem()))])
    }
}

/// A memory store whose queue depth and commit outcome can be scripted
pub struct ScriptedStore {
    pub inner: MemoryStore,
    /// Pending counts returned before the real count, one per read
    pub pending_script: Mutex<VecDeque<usize>>,
    /// Added to every pending count read
    pub stuck_writes: AtomicUsize,
    pub fail_commit: AtomicBool,
}

impl ScriptedStore {
    pub fn new(shard_factor: usize) -> Self {
        Self {
            inner: MemoryStore::in_memory(shard_factor).unwrap(),
            pending_script: Mutex::new(VecDeque::new()),
            stuck_writes: AtomicUsize::new(0),
            fail_commit: AtomicBool::new(false),
        }
    }
}

impl Store for ScriptedStore {
    fn begin_transaction(&self) -> Result<(), StoreError> {
        self.inner.begin_transaction()
    }

    fn commit(&self) -> Result<(), StoreError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            self.inner.rollback()?;
            return Err(StoreError::Commit("disk full".to_string()));
        }
        self.inner.commit()
    }

    fn rollback(&self) -> Result<(), StoreError> {
        self.inner.rollback()
    }

    fn write(&self, run_id: &str, object: CollectObject) -> Result<(), StoreError> {
        self.inner.write(run_id, object)
    }

    fn write_event(&self, run_id: &str, event: MonitorEvent) -> Result<(), StoreError> {
        self.inner.write_event(run_id, event)
    }

    fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        self.inner.get_run(run_id)
    }

    fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        self.inner.insert_run(run)
    }

    fn replace_run(&self, run: &Run) -> Result<bool, StoreError> {
        self.inner.replace_run(run)
    }

    fn delete_run(&self, run_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_run(run_id)
    }

    fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        self.inner.list_runs()
    }

    fn compare(&self, first: Option<&str>, second: &str) -> Result<ResultSet, StoreError> {
        self.inner.compare(first, second)
    }

    fn get_monitor_events(&self, run_id: &str) -> Result<Vec<MonitorEvent>, StoreError> {
        self.inner.get_monitor_events(run_id)
    }

    fn insert_results(&self, first: Option<&str>, second: &str, results: &ResultSet) -> Result<(), StoreError> {
        self.inner.insert_results(first, second, results)
    }

    fn get_results(&self, first: Option<&str>, second: &str) -> Result<Option<ResultSet>, StoreError> {
        self.inner.get_results(first, second)
    }

    fn pending_write_count(&self) -> usize {
        if let Some(scripted) = self.pending_script.lock().unwrap().pop_front() {
            return scripted;
        }
        self.inner.pending_write_count() + self.stuck_writes.load(Ordering::SeqCst)
    }

    fn shard_factor(&self) -> usize {
        self.inner.shard_factor()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.close()
    }
}

pub fn fast_drain() -> DrainSettings {
    DrainSettings {
        poll_interval: Duration::from_millis(5),
        sample_interval: Duration::from_millis(40),
        ..DrainSettings::default()
    }
}

pub fn coordinator(store: Arc<dyn Store>, token: CancellationToken, observer: Arc<RecordingObserver>) -> ScanCoordinator {
    ScanCoordinator::new(store, token)
        .with_observer(observer)
        .with_drain_settings(fast_drain())
}
