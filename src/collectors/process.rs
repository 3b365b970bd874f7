//! Running process collector (sysinfo)
//!
//! Processes are identified by `pid:start_time` so a reused PID is a
//! different object.

use anyhow::Result;
use std::collections::BTreeSet;
use sysinfo::{ProcessesToUpdate, System};

use super::Collector;
use crate::cancel::CancellationToken;
use crate::models::{CollectObject, ResultType};

#[derive(Default)]
pub struct ProcessCollector {
    system: Option<System>,
}

impl ProcessCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Collector for ProcessCollector {
    fn name(&self) -> &str {
        "processes"
    }

    fn result_types(&self) -> BTreeSet<ResultType> {
        BTreeSet::from([ResultType::Process])
    }

    fn start_run(&mut self, token: &CancellationToken, sink: &mut dyn FnMut(CollectObject)) -> Result<()> {
        let system = self.system.get_or_insert_with(System::new);
        for object in process_objects(system) {
            if token.is_cancelled() {
                break;
            }
            sink(object);
        }
        Ok(())
    }

    fn stop_run(&mut self) {
        self.system = None;
    }
}

/// Refresh `system` and describe every process it knows about
pub fn process_objects(system: &mut System) -> Vec<CollectObject> {
    system.refresh_processes(ProcessesToUpdate::All, true);

    system
        .processes()
        .iter()
        .map(|(pid, process)| {
            let start_time = process.start_time();
            let cmd: Vec<String> = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().to_string())
                .collect();

            let mut object = CollectObject::new(ResultType::Process, format!("{}:{}", pid.as_u32(), start_time))
                .with_attribute("pid", pid.as_u32())
                .with_attribute("name", process.name().to_string_lossy().to_string())
                .with_attribute("cmd", cmd)
                .with_attribute("start_time", start_time);
            if let Some(exe) = process.exe() {
                object = object.with_attribute("exe", exe.to_string_lossy().to_string());
            }
            if let Some(parent) = process.parent() {
                object = object.with_attribute("parent_pid", parent.as_u32());
            }
            object
        })
        .collect()
}
