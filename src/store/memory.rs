//! Transactional in-memory store with sharded writer threads
//!
//! Writes are routed to one of `shard_factor` writer threads over std
//! channels, so producers never block on the state lock. Each write carries
//! the epoch of the transaction it was issued in. Objects and events of a run
//! staged in the open transaction are kept apart from committed data until
//! commit, so replacing a committed run is only visible once the replacement
//! commits and a rollback leaves the old run untouched. Writes that reach a
//! writer after their run was rolled back (or was never inserted) are
//! dropped. When opened with a path, the committed state is saved as a JSON
//! snapshot on commit, on result insertion, on run deletion and on close.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use super::{Store, StoreError};
use crate::models::{ChangeRecord, CollectObject, MonitorEvent, ResultSet, ResultType, Run};

enum WriteOp {
    Object {
        run_id: String,
        epoch: u64,
        object: CollectObject,
    },
    Event {
        run_id: String,
        epoch: u64,
        event: MonitorEvent,
    },
}

type ObjectKey = (ResultType, String);
type ResultsKey = (Option<String>, String);
type ObjectMap = BTreeMap<ObjectKey, CollectObject>;

/// Runs staged by the open transaction, with everything written for them
struct Transaction {
    epoch: u64,
    runs: BTreeMap<String, Run>,
    /// Staged runs that replace a committed run of the same id
    replaces: BTreeSet<String>,
    objects: HashMap<String, ObjectMap>,
    events: HashMap<String, Vec<MonitorEvent>>,
}

impl Transaction {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            runs: BTreeMap::new(),
            replaces: BTreeSet::new(),
            objects: HashMap::new(),
            events: HashMap::new(),
        }
    }

    fn owns(&self, run_id: &str, epoch: u64) -> bool {
        self.epoch == epoch && self.runs.contains_key(run_id)
    }
}

/// Committed data a commit displaced, kept until the snapshot is saved
struct Displaced {
    run_id: String,
    run: Option<Run>,
    epoch: Option<u64>,
    objects: Option<ObjectMap>,
    events: Option<Vec<MonitorEvent>>,
}

#[derive(Default)]
struct State {
    runs: BTreeMap<String, Run>,
    /// Epoch each run was committed in; runs loaded from a snapshot have none
    run_epochs: HashMap<String, u64>,
    staged: Option<Transaction>,
    objects: HashMap<String, ObjectMap>,
    events: HashMap<String, Vec<MonitorEvent>>,
    results: BTreeMap<ResultsKey, ResultSet>,
}

impl State {
    /// Writes land in the transaction that issued them, or in the run that
    /// transaction committed
    fn owns_committed(&self, run_id: &str, epoch: u64) -> bool {
        self.run_epochs.get(run_id) == Some(&epoch)
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::Object { run_id, epoch, object } => {
                let key = (object.result_type, object.identity.clone());
                if let Some(staged) = self.staged.as_mut().filter(|t| t.owns(&run_id, epoch)) {
                    staged.objects.entry(run_id).or_default().insert(key, object);
                } else if self.owns_committed(&run_id, epoch) {
                    self.objects.entry(run_id).or_default().insert(key, object);
                } else {
                    log::debug!("Dropping object {} for unknown run {}", object.identity, run_id);
                }
            }
            WriteOp::Event { run_id, epoch, event } => {
                if let Some(staged) = self.staged.as_mut().filter(|t| t.owns(&run_id, epoch)) {
                    staged.events.entry(run_id).or_default().push(event);
                } else if self.owns_committed(&run_id, epoch) {
                    self.events.entry(run_id).or_default().push(event);
                } else {
                    log::debug!("Dropping event {} for unknown run {}", event.identity(), run_id);
                }
            }
        }
    }

    /// Move a transaction's runs into committed state, returning what they displaced
    fn apply_transaction(&mut self, mut staged: Transaction) -> Vec<Displaced> {
        let mut displaced = Vec::with_capacity(staged.runs.len());
        for (run_id, run) in std::mem::take(&mut staged.runs) {
            let objects = staged.objects.remove(&run_id);
            let events = staged.events.remove(&run_id);
            displaced.push(Displaced {
                run_id: run_id.clone(),
                run: self.runs.insert(run_id.clone(), run),
                epoch: self.run_epochs.insert(run_id.clone(), staged.epoch),
                objects: match objects {
                    Some(objects) => self.objects.insert(run_id.clone(), objects),
                    None => self.objects.remove(&run_id),
                },
                events: match events {
                    Some(events) => self.events.insert(run_id.clone(), events),
                    None => self.events.remove(&run_id),
                },
            });
        }
        displaced
    }

    /// Put displaced data back after a commit could not be saved
    fn restore(&mut self, displaced: Vec<Displaced>) {
        for entry in displaced {
            let run_id = entry.run_id;
            match entry.run {
                Some(run) => {
                    self.runs.insert(run_id.clone(), run);
                }
                None => {
                    self.runs.remove(&run_id);
                }
            }
            restore_entry(&mut self.run_epochs, &run_id, entry.epoch);
            restore_entry(&mut self.objects, &run_id, entry.objects);
            restore_entry(&mut self.events, &run_id, entry.events);
        }
    }

    fn remove_results_for(&mut self, run_id: &str) -> Vec<(ResultsKey, ResultSet)> {
        let keys: Vec<ResultsKey> = self
            .results
            .keys()
            .filter(|(first, second)| second == run_id || first.as_deref() == Some(run_id))
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.results.remove(&key).map(|results| (key, results)))
            .collect()
    }

    fn committed(&self, run_id: &str) -> Result<(), StoreError> {
        if self.runs.contains_key(run_id) {
            Ok(())
        } else {
            Err(StoreError::RunNotFound(run_id.to_string()))
        }
    }

    fn snapshot(&self) -> Snapshot {
        let committed = |run_id: &String| self.runs.contains_key(run_id);
        Snapshot {
            runs: self.runs.values().cloned().collect(),
            objects: self
                .objects
                .iter()
                .filter(|(run_id, _)| committed(run_id))
                .map(|(run_id, objects)| (run_id.clone(), objects.values().cloned().collect()))
                .collect(),
            events: self
                .events
                .iter()
                .filter(|(run_id, _)| committed(run_id))
                .map(|(run_id, events)| (run_id.clone(), events.clone()))
                .collect(),
            results: self
                .results
                .iter()
                .map(|((first, second), results)| StoredResults {
                    first: first.clone(),
                    second: second.clone(),
                    results: results.clone(),
                })
                .collect(),
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = State::default();
        for run in snapshot.runs {
            state.runs.insert(run.run_id.clone(), run);
        }
        for (run_id, objects) in snapshot.objects {
            let map = objects
                .into_iter()
                .map(|object| ((object.result_type, object.identity.clone()), object))
                .collect();
            state.objects.insert(run_id, map);
        }
        state.events = snapshot.events.into_iter().collect();
        for stored in snapshot.results {
            state.results.insert((stored.first, stored.second), stored.results);
        }
        state
    }
}

fn restore_entry<V>(map: &mut HashMap<String, V>, key: &str, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(key.to_string(), value);
        }
        None => {
            map.remove(key);
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    runs: Vec<Run>,
    #[serde(default)]
    objects: BTreeMap<String, Vec<CollectObject>>,
    #[serde(default)]
    events: BTreeMap<String, Vec<MonitorEvent>>,
    #[serde(default)]
    results: Vec<StoredResults>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredResults {
    first: Option<String>,
    second: String,
    results: ResultSet,
}

struct Shared {
    state: Mutex<State>,
    pending: AtomicUsize,
    /// Epoch of the most recently opened transaction
    epoch: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct MemoryStore {
    shared: Arc<Shared>,
    senders: Mutex<Option<Vec<Sender<WriteOp>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shard_factor: usize,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// A store that is never saved to disk
    pub fn in_memory(shard_factor: usize) -> Result<Self, StoreError> {
        Self::start(State::default(), shard_factor, None)
    }

    /// Open the snapshot at `path`, starting empty when the file does not exist
    pub fn open(path: &Path, shard_factor: usize) -> Result<Self, StoreError> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let snapshot: Snapshot = serde_json::from_str(&content)?;
            log::debug!(
                "Loaded store snapshot {} with {} run(s)",
                path.display(),
                snapshot.runs.len()
            );
            State::from_snapshot(snapshot)
        } else {
            State::default()
        };
        Self::start(state, shard_factor, Some(path.to_path_buf()))
    }

    fn start(state: State, shard_factor: usize, path: Option<PathBuf>) -> Result<Self, StoreError> {
        let shard_factor = shard_factor.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            pending: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
        });

        let mut senders = Vec::with_capacity(shard_factor);
        let mut workers = Vec::with_capacity(shard_factor);
        for index in 0..shard_factor {
            let (sender, receiver) = mpsc::channel();
            workers.push(spawn_writer(index, receiver, Arc::clone(&shared)).map_err(StoreError::Worker)?);
            senders.push(sender);
        }

        Ok(Self {
            shared,
            senders: Mutex::new(Some(senders)),
            workers: Mutex::new(workers),
            shard_factor,
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn enqueue(&self, shard_key: u64, op: WriteOp) -> Result<(), StoreError> {
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        let senders = senders.as_ref().ok_or(StoreError::Closed)?;
        let sender = &senders[(shard_key % senders.len() as u64) as usize];

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(op).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn persist(&self, state: &State) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_error = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let content = serde_json::to_vec(&state.snapshot())?;
        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, content).map_err(io_error)?;
        std::fs::rename(&temp, path).map_err(io_error)?;
        Ok(())
    }
}

fn spawn_writer(index: usize, receiver: Receiver<WriteOp>, shared: Arc<Shared>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("store-writer-{}", index))
        .spawn(move || {
            for op in receiver {
                shared.lock().apply(op);
                shared.pending.fetch_sub(1, Ordering::SeqCst);
            }
        })
}

fn shard_key(parts: &[&str]) -> u64 {
    let mut hasher = DefaultHasher::new();
    parts.hash(&mut hasher);
    hasher.finish()
}

impl Store for MemoryStore {
    fn begin_transaction(&self) -> Result<(), StoreError> {
        let mut state = self.shared.lock();
        if state.staged.is_some() {
            return Err(StoreError::TransactionOpen);
        }
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        state.staged = Some(Transaction::new(epoch));
        Ok(())
    }

    fn commit(&self) -> Result<(), StoreError> {
        let mut state = self.shared.lock();
        let staged = state.staged.take().ok_or(StoreError::NoTransaction)?;
        let replaced: Vec<String> = staged.replaces.iter().cloned().collect();
        let displaced = state.apply_transaction(staged);
        let mut stale = Vec::new();
        for run_id in &replaced {
            stale.extend(state.remove_results_for(run_id));
        }

        if let Err(e) = self.persist(&state) {
            // A failed commit leaves the committed state as it was
            state.restore(displaced);
            state.results.extend(stale);
            return Err(StoreError::Commit(e.to_string()));
        }
        for run_id in &replaced {
            log::info!("Replaced existing run {}", run_id);
        }
        Ok(())
    }

    fn rollback(&self) -> Result<(), StoreError> {
        let mut state = self.shared.lock();
        let staged = state.staged.take().ok_or(StoreError::NoTransaction)?;
        if !staged.replaces.is_empty() {
            log::debug!("Kept {} run(s) that the rolled back transaction replaced", staged.replaces.len());
        }
        Ok(())
    }

    fn write(&self, run_id: &str, object: CollectObject) -> Result<(), StoreError> {
        let key = shard_key(&[run_id, object.result_type.as_str(), &object.identity]);
        self.enqueue(
            key,
            WriteOp::Object {
                run_id: run_id.to_string(),
                epoch: self.shared.epoch.load(Ordering::SeqCst),
                object,
            },
        )
    }

    fn write_event(&self, run_id: &str, event: MonitorEvent) -> Result<(), StoreError> {
        // Events of a run share one shard so their order is kept
        self.enqueue(
            shard_key(&[run_id]),
            WriteOp::Event {
                run_id: run_id.to_string(),
                epoch: self.shared.epoch.load(Ordering::SeqCst),
                event,
            },
        )
    }

    fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self.shared.lock().runs.get(run_id).cloned())
    }

    fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
        let mut state = self.shared.lock();
        if state.runs.contains_key(&run.run_id) {
            return Err(StoreError::DuplicateRun(run.run_id.clone()));
        }
        let staged = state.staged.as_mut().ok_or(StoreError::NoTransaction)?;
        if staged.runs.contains_key(&run.run_id) {
            return Err(StoreError::DuplicateRun(run.run_id.clone()));
        }
        staged.runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    fn replace_run(&self, run: &Run) -> Result<bool, StoreError> {
        let mut state = self.shared.lock();
        let exists = state.runs.contains_key(&run.run_id);
        let staged = state.staged.as_mut().ok_or(StoreError::NoTransaction)?;
        if staged.runs.contains_key(&run.run_id) {
            return Err(StoreError::DuplicateRun(run.run_id.clone()));
        }
        staged.runs.insert(run.run_id.clone(), run.clone());
        if exists {
            staged.replaces.insert(run.run_id.clone());
        }
        Ok(exists)
    }

    fn delete_run(&self, run_id: &str) -> Result<bool, StoreError> {
        let mut state = self.shared.lock();
        if state.runs.remove(run_id).is_none() {
            return Ok(false);
        }
        state.run_epochs.remove(run_id);
        state.objects.remove(run_id);
        state.events.remove(run_id);
        state.remove_results_for(run_id);
        self.persist(&state)?;
        Ok(true)
    }

    fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        let mut runs: Vec<Run> = self.shared.lock().runs.values().cloned().collect();
        runs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(runs)
    }

    fn compare(&self, first: Option<&str>, second: &str) -> Result<ResultSet, StoreError> {
        let state = self.shared.lock();
        state.committed(second)?;
        if let Some(first) = first {
            state.committed(first)?;
        }

        let empty = BTreeMap::new();
        let base = first
            .and_then(|first| state.objects.get(first))
            .unwrap_or(&empty);
        let current = state.objects.get(second).unwrap_or(&empty);

        let mut records = Vec::new();
        for (key, object) in current {
            match base.get(key) {
                None => records.push(ChangeRecord::created(object.clone(), first, second)),
                Some(previous) if previous.attributes != object.attributes => {
                    if let Some(first) = first {
                        records.push(ChangeRecord::modified(previous.clone(), object.clone(), first, second));
                    }
                }
                Some(_) => {}
            }
        }
        if let Some(first) = first {
            for (key, object) in base {
                if !current.contains_key(key) {
                    records.push(ChangeRecord::deleted(object.clone(), first, second));
                }
            }
        }

        Ok(ResultSet::from_records(records))
    }

    fn get_monitor_events(&self, run_id: &str) -> Result<Vec<MonitorEvent>, StoreError> {
        let state = self.shared.lock();
        state.committed(run_id)?;
        Ok(state.events.get(run_id).cloned().unwrap_or_default())
    }

    fn insert_results(&self, first: Option<&str>, second: &str, results: &ResultSet) -> Result<(), StoreError> {
        let mut state = self.shared.lock();
        state.committed(second)?;
        state
            .results
            .insert((first.map(str::to_string), second.to_string()), results.clone());
        self.persist(&state)
    }

    fn get_results(&self, first: Option<&str>, second: &str) -> Result<Option<ResultSet>, StoreError> {
        let key = (first.map(str::to_string), second.to_string());
        Ok(self.shared.lock().results.get(&key).cloned())
    }

    fn pending_write_count(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    fn shard_factor(&self) -> usize {
        self.shard_factor
    }

    fn close(&self) -> Result<(), StoreError> {
        let senders = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(senders) = senders else {
            return Ok(());
        };
        // Closing the channels lets each writer finish its queue and exit
        drop(senders);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if worker.join().is_err() {
                log::error!("Store writer thread panicked");
            }
        }

        let state = self.shared.lock();
        self.persist(&state)
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Failed to close store: {}", e);
        }
    }
}
