//! Output formatting module
//!
//! Handles:
//! - Human-readable summaries of phases, comparisons and guided scans
//! - JSON output of the same reports
//! - Run listings and rule violation reports

pub mod progress;

pub use progress::ProgressObserver;

use anyhow::Result;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::time::Duration;

use crate::analysis::AnalysisStatus;
use crate::drain::DrainOutcome;
use crate::export::ExportSummary;
use crate::models::Run;
use crate::rules::Violation;
use crate::workflow::{CompareReport, GuidedReport, PhaseReport};

/// Milliseconds below one second, otherwise seconds with two decimals
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds < 1.0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{:.2}s", seconds)
    }
}

fn drain_text(drain: &DrainOutcome) -> String {
    match drain {
        DrainOutcome::Drained { elapsed } => format!("flushed in {}", format_duration(*elapsed)),
        DrainOutcome::Cancelled { remaining } => format!("cancelled with {} writes queued", remaining),
    }
}

fn drain_json(drain: &DrainOutcome) -> Value {
    match drain {
        DrainOutcome::Drained { elapsed } => json!({ "status": "drained", "elapsed_ms": elapsed.as_millis() as u64 }),
        DrainOutcome::Cancelled { remaining } => json!({ "status": "cancelled", "remaining": remaining }),
    }
}

pub fn format_phase_human(report: &PhaseReport) -> String {
    let mut out = String::new();
    let noun = match report.run_type {
        crate::models::RunType::Collect => "objects",
        crate::models::RunType::Monitor => "events",
    };
    let _ = writeln!(out, "Run Summary:");
    let _ = writeln!(out, "  Run: {}", report.run_id);
    let _ = writeln!(out, "  Recorded: {} {}", report.objects_written, noun);
    let _ = writeln!(out, "  Store: {}", drain_text(&report.drain));
    out
}

pub fn phase_json(report: &PhaseReport) -> Value {
    json!({
        "run_id": report.run_id,
        "run_type": report.run_type,
        "objects_written": report.objects_written,
        "drain": drain_json(&report.drain),
    })
}

pub fn format_compare_human(report: &CompareReport) -> String {
    let mut out = String::new();
    let first = report.first_run_id.as_deref().unwrap_or("<empty>");

    if report.results.is_empty() {
        let _ = writeln!(out, "No changes found between {} and {}.", first, report.second_run_id);
    } else {
        let _ = writeln!(
            out,
            "Found {} changes in {} groups between {} and {}:\n",
            report.results.len(),
            report.results.group_count(),
            first,
            report.second_run_id
        );

        for (key, list) in report.results.groups() {
            let _ = writeln!(out, "{} ({}):", key, list.len());

            // Highest severity first, then identity, for stable output
            let mut entries: Vec<_> = list.iter().collect();
            entries.sort_by(|a, b| {
                let severity = |r: &&crate::models::CompareResult| r.classification.as_ref().map(|c| c.severity());
                severity(b)
                    .cmp(&severity(a))
                    .then_with(|| a.record.identity().cmp(b.record.identity()))
            });

            for entry in entries {
                match &entry.classification {
                    Some(classification) => {
                        let rules: Vec<_> = classification.matched_rules().iter().map(|r| r.name.as_str()).collect();
                        if rules.is_empty() {
                            let _ = writeln!(out, "  [{}] {}", classification.severity(), entry.record.identity());
                        } else {
                            let _ = writeln!(
                                out,
                                "  [{}] {} ({})",
                                classification.severity(),
                                entry.record.identity(),
                                rules.join(", ")
                            );
                        }
                    }
                    None => {
                        let _ = writeln!(out, "  {}", entry.record.identity());
                    }
                }
            }
            let _ = writeln!(out);
        }
    }

    let severities = report.results.severity_counts();
    if !severities.is_empty() {
        let _ = writeln!(out, "Severity Summary:");
        for (severity, count) in severities.iter().rev() {
            let _ = writeln!(out, "  {}: {}", severity, count);
        }
    }

    match &report.analysis {
        Some(AnalysisStatus::Analyzed { records }) => {
            let _ = writeln!(out, "  Analysis: {} records classified", records);
        }
        Some(AnalysisStatus::Skipped { violations, rules_source }) => {
            let _ = writeln!(
                out,
                "  Analysis: skipped, {} rule violation(s) in {}",
                violations, rules_source
            );
        }
        None => {}
    }
    for path in &report.exported {
        let _ = writeln!(out, "  Exported: {}", path.display());
    }
    out
}

pub fn compare_json(report: &CompareReport) -> Value {
    json!({
        "first_run_id": report.first_run_id,
        "second_run_id": report.second_run_id,
        "analysis": report.analysis,
        "summary": ExportSummary::new(report.first_run_id.as_deref(), &report.second_run_id, &report.results),
        "exported": report.exported,
    })
}

pub fn format_guided_human(report: &GuidedReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Guided Scan {}:", report.run_ids.base);
    for phase in [&report.baseline, &report.monitoring, &report.after] {
        let _ = writeln!(
            out,
            "  {}: {} recorded, {}",
            phase.run_id,
            phase.objects_written,
            drain_text(&phase.drain)
        );
    }
    let _ = writeln!(out);
    out.push_str(&format_compare_human(&report.compare));
    out
}

pub fn guided_json(report: &GuidedReport) -> Value {
    json!({
        "base_id": report.run_ids.base,
        "phases": [phase_json(&report.baseline), phase_json(&report.monitoring), phase_json(&report.after)],
        "compare": compare_json(&report.compare),
    })
}

pub fn format_runs_human(runs: &[Run]) -> String {
    let mut out = String::new();
    if runs.is_empty() {
        let _ = writeln!(out, "No runs found.");
        return out;
    }
    let _ = writeln!(out, "Found {} runs:\n", runs.len());
    for run in runs {
        let types: Vec<_> = run.result_types.iter().map(|t| t.as_str()).collect();
        let _ = writeln!(
            out,
            "{}  {:?}  {}  {}  [{}]",
            run.run_id,
            run.run_type,
            run.timestamp.to_rfc3339(),
            run.platform,
            types.join(", ")
        );
    }
    out
}

pub fn format_violations_human(rules_source: &str, violations: &[Violation]) -> String {
    let mut out = String::new();
    if violations.is_empty() {
        let _ = writeln!(out, "Rules in {} are valid.", rules_source);
        return out;
    }
    let _ = writeln!(out, "Found {} violation(s) in {}:", violations.len(), rules_source);
    for violation in violations {
        let _ = writeln!(out, "  {}", violation);
    }
    out
}

pub fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
