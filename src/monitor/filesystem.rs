//! File system change monitor
//!
//! Diffs directory snapshots between polls. A deletion and a creation in the
//! same cycle whose metadata is otherwise identical are reported as a rename.

use anyhow::Result;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use super::polling::{PollingMonitor, SnapshotSource};
use super::tracker::Change;
use crate::cancel::CancellationToken;
use crate::collectors::{Collector, FileCollector};
use crate::models::{ChangeType, CollectObject, FileSystemEvent, MonitorEvent, ResultType};

pub type FileSystemMonitor = PollingMonitor<FileSystemSource>;

impl FileSystemMonitor {
    pub fn paths(roots: Vec<PathBuf>, interval: Duration) -> Self {
        PollingMonitor::new(FileSystemSource::new(roots), interval)
    }
}

pub struct FileSystemSource {
    collector: FileCollector,
}

impl FileSystemSource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            collector: FileCollector::new(roots),
        }
    }
}

/// Attributes that identify the same file across a rename
fn rename_fingerprint(object: &CollectObject) -> serde_json::Map<String, serde_json::Value> {
    let mut attributes = object.attributes.clone();
    attributes.remove("path");
    attributes
}

fn event(change_type: ChangeType, object: CollectObject, old_path: Option<String>, snapshot: bool) -> MonitorEvent {
    MonitorEvent::FileSystem(FileSystemEvent {
        change_type,
        path: object.identity.clone(),
        old_path,
        timestamp: Utc::now(),
        snapshot: snapshot.then_some(object),
    })
}

impl SnapshotSource for FileSystemSource {
    fn name(&self) -> &str {
        "file-system"
    }

    fn result_types(&self) -> BTreeSet<ResultType> {
        BTreeSet::from([ResultType::FileMonitor])
    }

    fn snapshot(&mut self) -> Result<BTreeMap<String, CollectObject>> {
        let mut snapshot = BTreeMap::new();
        self.collector.start_run(&CancellationToken::new(), &mut |object| {
            snapshot.insert(object.identity.clone(), object);
        })?;
        Ok(snapshot)
    }

    fn events(&self, changes: Vec<Change<CollectObject>>) -> Vec<MonitorEvent> {
        let mut created = Vec::new();
        let mut deleted = Vec::new();
        let mut events = Vec::new();

        for change in changes {
            match change {
                Change::Created(object) => created.push(object),
                Change::Deleted(object) => deleted.push(object),
                Change::Modified { after, .. } => events.push(event(ChangeType::Modified, after, None, true)),
            }
        }

        for object in created {
            let fingerprint = rename_fingerprint(&object);
            match deleted.iter().position(|old| rename_fingerprint(old) == fingerprint) {
                Some(index) => {
                    let old = deleted.swap_remove(index);
                    events.push(event(ChangeType::Renamed, object, Some(old.identity), true));
                }
                None => events.push(event(ChangeType::Created, object, None, true)),
            }
        }
        for object in deleted {
            // Nothing left on disk to snapshot
            events.push(event(ChangeType::Deleted, object, None, false));
        }

        events
    }
}
