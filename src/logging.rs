//! Logging setup and the structured log observer
//!
//! Log lines from the coordinators take the form `message | {json}` so they
//! stay readable in a terminal and parseable by log tooling.

use anyhow::Result;
use log::LevelFilter;
use serde_json::{json, Value};

use crate::observer::{DrainProgress, Phase, PhaseObserver, PhaseOutcome};
use crate::workflow::WorkflowState;

/// Install the process logger. `RUST_LOG` overrides `level`.
///
/// With `unified_log` on macOS, records go to the Unified Logging System
/// under the app subsystem instead of stderr.
pub fn init_logging(level: LevelFilter, unified_log: bool) -> Result<()> {
    #[cfg(target_os = "macos")]
    if unified_log {
        let logger = oslog::OsLogger::new(crate::constants::APP_SUBSYSTEM);
        log::set_boxed_logger(Box::new(logger)).map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))?;
        log::set_max_level(level);
        return Ok(());
    }
    #[cfg(not(target_os = "macos"))]
    if unified_log {
        eprintln!("Warning: --unified-log is only available on macOS; logging to stderr");
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .format_timestamp_millis()
        .target(env_logger::Target::Stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))
}

/// Level from the `--quiet` / `--verbose` flags
pub fn level_for(quiet: bool, verbose: u8) -> LevelFilter {
    match (quiet, verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Warn,
        (false, 1) => LevelFilter::Info,
        (false, 2) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    }
}

pub fn structured_line(message: &str, payload: &Value) -> String {
    format!("{} | {}", message, payload)
}

fn log_structured(level: log::Level, message: &str, payload: &Value) {
    log::log!(level, "{}", structured_line(message, payload));
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Writes every workflow event to the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl PhaseObserver for LogObserver {
    fn on_phase_start(&self, phase: Phase, run_id: &str) {
        let payload = json!({
            "event": "phase_start",
            "phase": phase.to_string(),
            "run_id": run_id,
            "timestamp": timestamp(),
        });
        log_structured(log::Level::Info, &format!("Starting {} for {}", phase, run_id), &payload);
    }

    fn on_phase_end(&self, phase: Phase, run_id: &str, outcome: &PhaseOutcome) {
        let payload = json!({
            "event": "phase_end",
            "phase": phase.to_string(),
            "run_id": run_id,
            "outcome": outcome.to_string(),
            "timestamp": timestamp(),
        });
        let level = match outcome {
            PhaseOutcome::Completed => log::Level::Info,
            PhaseOutcome::Skipped(_) | PhaseOutcome::Cancelled => log::Level::Warn,
            PhaseOutcome::Failed(_) => log::Level::Error,
        };
        log_structured(level, &format!("Finished {} for {}: {}", phase, run_id, outcome), &payload);
    }

    fn on_progress(&self, run_id: &str, progress: &DrainProgress) {
        let payload = json!({
            "event": "drain_progress",
            "run_id": run_id,
            "pending": progress.pending,
            "drained": progress.drained,
            "rate": progress.rate,
            "eta": progress.eta,
            "elapsed_secs": progress.elapsed.as_secs_f64(),
            "timestamp": timestamp(),
        });
        log_structured(
            log::Level::Info,
            &format!("{} writes pending for {}, ETA {}", progress.pending, run_id, progress.eta),
            &payload,
        );
    }

    fn on_advisory(&self, message: &str) {
        let payload = json!({
            "event": "advisory",
            "timestamp": timestamp(),
        });
        log_structured(log::Level::Warn, message, &payload);
    }

    fn on_state_change(&self, from: WorkflowState, to: WorkflowState) {
        log::debug!("Workflow {} -> {}", from, to);
    }
}
