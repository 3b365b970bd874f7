//! File system collector
//!
//! Walks each root recursively and emits one File object per entry. Entries
//! are inspected with `symlink_metadata`, so links are reported but never
//! followed. Unreadable directories and entries are skipped.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::Collector;
use crate::cancel::CancellationToken;
use crate::models::{CollectObject, ResultType};

pub struct FileCollector {
    roots: Vec<PathBuf>,
    skipped: usize,
}

impl FileCollector {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots, skipped: 0 }
    }

    /// Entries skipped as unreadable during the last run
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn walk(&mut self, dir: &Path, token: &CancellationToken, sink: &mut dyn FnMut(CollectObject)) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Skipping unreadable directory {}: {}", dir.display(), e);
                self.skipped += 1;
                return;
            }
        };

        for entry in entries {
            if token.is_cancelled() {
                return;
            }
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(_) => {
                    self.skipped += 1;
                    continue;
                }
            };
            let Some(object) = file_object(&path) else {
                self.skipped += 1;
                continue;
            };
            let descend = object.attributes.get("is_directory") == Some(&serde_json::Value::Bool(true));
            sink(object);
            if descend {
                self.walk(&path, token, sink);
            }
        }
    }
}

impl Collector for FileCollector {
    fn name(&self) -> &str {
        "files"
    }

    fn result_types(&self) -> BTreeSet<ResultType> {
        BTreeSet::from([ResultType::File])
    }

    fn start_run(&mut self, token: &CancellationToken, sink: &mut dyn FnMut(CollectObject)) -> Result<()> {
        self.skipped = 0;
        let roots = self.roots.clone();
        for root in &roots {
            if token.is_cancelled() {
                return Ok(());
            }
            let Some(object) = file_object(root) else {
                bail!("Path does not exist or is unreadable: {}", root.display());
            };
            let is_dir = object.attributes.get("is_directory") == Some(&serde_json::Value::Bool(true));
            sink(object);
            if is_dir {
                self.walk(root, token, sink);
            }
        }
        if self.skipped > 0 {
            log::info!("Skipped {} unreadable entries", self.skipped);
        }
        Ok(())
    }
}

/// Snapshot of one file system entry, without following links
pub fn file_object(path: &Path) -> Option<CollectObject> {
    let metadata = fs::symlink_metadata(path).ok()?;
    let display = path.to_string_lossy().to_string();

    let mut object = CollectObject::new(ResultType::File, display.clone())
        .with_attribute("path", display)
        .with_attribute("size", metadata.len())
        .with_attribute("is_directory", metadata.is_dir())
        .with_attribute("is_link", metadata.file_type().is_symlink());

    if let Ok(modified) = metadata.modified() {
        let modified: DateTime<Utc> = modified.into();
        object = object.with_attribute("last_modified", modified.to_rfc3339());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let mode = metadata.permissions().mode();
        object = object
            .with_attribute("permissions", format!("{:o}", mode & 0o7777))
            .with_attribute("is_executable", metadata.is_file() && mode & 0o111 != 0)
            .with_attribute("owner", metadata.uid().to_string());
    }

    #[cfg(not(unix))]
    {
        let executable = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ["exe", "dll", "sys", "bat", "cmd", "ps1"].contains(&ext.to_ascii_lowercase().as_str()));
        object = object
            .with_attribute("permissions", if metadata.permissions().readonly() { "r" } else { "rw" })
            .with_attribute("is_executable", metadata.is_file() && executable);
    }

    Some(object)
}
