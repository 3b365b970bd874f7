//! Result export
//!
//! Handles:
//! - The export context handed to exporters
//! - Summary statistics (per group, per severity)
//! - The reference JSON exporter writing `.json.txt` files

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::analysis::AnalysisStatus;
use crate::models::{Platform, ResultSet, Severity};

/// What is being exported and where to
#[derive(Debug, Clone, Serialize)]
pub struct ExportContext {
    pub first_run_id: Option<String>,
    pub second_run_id: String,
    pub output_dir: PathBuf,
    /// One results file per group key instead of a single file
    pub exploded: bool,
    pub analysis: Option<AnalysisStatus>,
    pub version: String,
    pub platform: Platform,
    pub generated_at: DateTime<Utc>,
}

impl ExportContext {
    pub fn new(first_run_id: Option<&str>, second_run_id: &str, output_dir: &Path, exploded: bool) -> Self {
        Self {
            first_run_id: first_run_id.map(str::to_string),
            second_run_id: second_run_id.to_string(),
            output_dir: output_dir.to_path_buf(),
            exploded,
            analysis: None,
            version: crate::VERSION.to_string(),
            platform: Platform::current(),
            generated_at: Utc::now(),
        }
    }

    pub fn with_analysis(mut self, analysis: Option<AnalysisStatus>) -> Self {
        self.analysis = analysis;
        self
    }

    /// File name stem shared by every file of this export
    pub fn file_stem(&self) -> String {
        match &self.first_run_id {
            Some(first) => format!(
                "{}_vs_{}",
                sanitize_file_component(first),
                sanitize_file_component(&self.second_run_id)
            ),
            None => sanitize_file_component(&self.second_run_id),
        }
    }
}

pub trait Exporter: Send + Sync {
    /// Write `results` and return the paths written
    fn export(&self, context: &ExportContext, results: &ResultSet) -> Result<Vec<PathBuf>>;
}

/// Counts describing an exported result set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportSummary {
    pub first_run_id: Option<String>,
    pub second_run_id: String,
    pub total: usize,
    pub groups: BTreeMap<String, usize>,
    pub severities: BTreeMap<Severity, usize>,
    pub unclassified: usize,
}

impl ExportSummary {
    pub fn new(first_run_id: Option<&str>, second_run_id: &str, results: &ResultSet) -> Self {
        Self {
            first_run_id: first_run_id.map(str::to_string),
            second_run_id: second_run_id.to_string(),
            total: results.len(),
            groups: results
                .groups()
                .map(|(key, list)| (key.to_string(), list.len()))
                .collect(),
            severities: results.severity_counts(),
            unclassified: results.iter().filter(|r| r.classification.is_none()).count(),
        }
    }
}

#[derive(Serialize)]
struct SummaryDocument<'a> {
    metadata: &'a ExportContext,
    git_hash: &'a str,
    summary: ExportSummary,
}

/// Writes `<stem>_summary.json.txt` plus `<stem>_results.json.txt`, or with
/// `exploded` one `<stem>_<GROUP>.json.txt` per group
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonExporter;

impl JsonExporter {
    fn write(path: &Path, value: &impl Serialize) -> Result<()> {
        let content = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize {}", path.display()))?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }
}

impl Exporter for JsonExporter {
    fn export(&self, context: &ExportContext, results: &ResultSet) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&context.output_dir)
            .with_context(|| format!("Failed to create output directory {}", context.output_dir.display()))?;

        let stem = context.file_stem();
        let mut written = Vec::new();

        let summary_path = context.output_dir.join(format!("{}_summary.json.txt", stem));
        let document = SummaryDocument {
            metadata: context,
            git_hash: crate::GIT_HASH,
            summary: ExportSummary::new(context.first_run_id.as_deref(), &context.second_run_id, results),
        };
        Self::write(&summary_path, &document)?;
        written.push(summary_path);

        if context.exploded {
            for (key, list) in results.groups() {
                let path = context.output_dir.join(format!("{}_{}.json.txt", stem, key));
                Self::write(&path, &list)?;
                written.push(path);
            }
        } else {
            let path = context.output_dir.join(format!("{}_results.json.txt", stem));
            Self::write(&path, results)?;
            written.push(path);
        }

        log::info!("Exported {} record(s) to {}", results.len(), context.output_dir.display());
        Ok(written)
    }
}

/// Make a run id safe to use inside a file name
pub fn sanitize_file_component(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}
