//! Process start/exit monitor

use anyhow::Result;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use sysinfo::System;

use super::polling::{PollingMonitor, SnapshotSource};
use super::tracker::Change;
use crate::collectors::process::process_objects;
use crate::models::{ChangeType, CollectObject, GenericEvent, MonitorEvent, ResultType};

pub type ProcessMonitor = PollingMonitor<ProcessSource>;

impl ProcessMonitor {
    pub fn processes(interval: Duration) -> Self {
        PollingMonitor::new(ProcessSource::new(), interval)
    }
}

pub struct ProcessSource {
    system: System,
}

impl ProcessSource {
    pub fn new() -> Self {
        Self { system: System::new() }
    }
}

impl Default for ProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSource for ProcessSource {
    fn name(&self) -> &str {
        "processes"
    }

    fn result_types(&self) -> BTreeSet<ResultType> {
        BTreeSet::from([ResultType::Process])
    }

    fn snapshot(&mut self) -> Result<BTreeMap<String, CollectObject>> {
        Ok(process_objects(&mut self.system)
            .into_iter()
            .map(|object| (object.identity.clone(), object))
            .collect())
    }

    fn events(&self, changes: Vec<Change<CollectObject>>) -> Vec<MonitorEvent> {
        let timestamp = Utc::now();
        changes
            .into_iter()
            .map(|change| {
                let (change_type, object) = match change {
                    Change::Created(object) => (ChangeType::Created, object),
                    Change::Deleted(object) => (ChangeType::Deleted, object),
                    Change::Modified { after, .. } => (ChangeType::Modified, after),
                };
                MonitorEvent::Generic(GenericEvent {
                    result_type: ResultType::Process,
                    change_type,
                    identity: object.identity,
                    attributes: object.attributes,
                    timestamp,
                })
            })
            .collect()
    }
}
