//! Terminal progress for scan phases
//!
//! Phase starts and ends are printed as lines on stderr; drain progress
//! rewrites a single line with carriage returns until the drain ends.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::observer::{DrainProgress, Phase, PhaseObserver, PhaseOutcome};

/// Present-tense label for a phase
fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Collect => "Collecting",
        Phase::Monitor => "Monitoring",
        Phase::Drain => "Flushing writes for",
        Phase::Compare => "Comparing",
        Phase::Analyze => "Analyzing",
        Phase::Persist => "Saving results for",
        Phase::Export => "Exporting",
    }
}

pub struct ProgressObserver {
    quiet_mode: bool,
    /// A carriage-return progress line is on screen
    line_open: AtomicBool,
}

impl ProgressObserver {
    pub fn new(quiet_mode: bool) -> Self {
        Self {
            quiet_mode,
            line_open: AtomicBool::new(false),
        }
    }

    fn close_line(&self) {
        if self.line_open.swap(false, Ordering::SeqCst) {
            eprintln!();
        }
    }
}

pub fn progress_line(run_id: &str, progress: &DrainProgress) -> String {
    format!(
        "{} writes pending for {} ({:.0}/s, ETA {})",
        progress.pending, run_id, progress.rate, progress.eta
    )
}

impl PhaseObserver for ProgressObserver {
    fn on_phase_start(&self, phase: Phase, run_id: &str) {
        if self.quiet_mode {
            return;
        }
        self.close_line();
        eprintln!("{} {}...", phase_label(phase), run_id);
    }

    fn on_phase_end(&self, phase: Phase, run_id: &str, outcome: &PhaseOutcome) {
        if self.quiet_mode {
            return;
        }
        self.close_line();
        match outcome {
            PhaseOutcome::Completed => eprintln!("✓ {} {} - completed", phase_label(phase), run_id),
            other => eprintln!("✗ {} {} - {}", phase_label(phase), run_id, other),
        }
        io::stderr().flush().unwrap_or(());
    }

    fn on_progress(&self, run_id: &str, progress: &DrainProgress) {
        if self.quiet_mode {
            return;
        }
        eprint!("\r{}", progress_line(run_id, progress));
        self.line_open.store(true, Ordering::SeqCst);
        io::stderr().flush().unwrap_or(());
    }

    fn on_advisory(&self, message: &str) {
        // Advisories are shown even in quiet mode
        self.close_line();
        eprintln!("Advisory: {}", message);
    }
}
