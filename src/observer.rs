//! Phase observation
//!
//! The coordinators report progress only through [`PhaseObserver`]; logging,
//! terminal progress and test recorders are all observers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::drain::Eta;
use crate::workflow::WorkflowState;

/// A unit of work the coordinators report on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Collect,
    Monitor,
    Drain,
    Compare,
    Analyze,
    Persist,
    Export,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Collect => "collect",
            Phase::Monitor => "monitor",
            Phase::Drain => "drain",
            Phase::Compare => "compare",
            Phase::Analyze => "analyze",
            Phase::Persist => "persist",
            Phase::Export => "export",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    Skipped(String),
    Cancelled,
    Failed(String),
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseOutcome::Completed => f.write_str("completed"),
            PhaseOutcome::Skipped(reason) => write!(f, "skipped ({})", reason),
            PhaseOutcome::Cancelled => f.write_str("cancelled"),
            PhaseOutcome::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// One drain-rate sample of the store write queue
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrainProgress {
    /// Writes still queued
    pub pending: usize,
    /// Writes applied since the previous sample; negative when the queue grew
    pub drained: i64,
    /// Writes per second over the sample interval
    pub rate: f64,
    pub eta: Eta,
    /// Time since the drain started
    pub elapsed: Duration,
}

pub trait PhaseObserver: Send + Sync {
    fn on_phase_start(&self, _phase: Phase, _run_id: &str) {}

    fn on_phase_end(&self, _phase: Phase, _run_id: &str, _outcome: &PhaseOutcome) {}

    fn on_progress(&self, _run_id: &str, _progress: &DrainProgress) {}

    fn on_advisory(&self, _message: &str) {}

    fn on_state_change(&self, _from: WorkflowState, _to: WorkflowState) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl PhaseObserver for NullObserver {}

/// Fan-out to several observers, in registration order
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn PhaseObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn PhaseObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn PhaseObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl PhaseObserver for Observers {
    fn on_phase_start(&self, phase: Phase, run_id: &str) {
        for observer in &self.observers {
            observer.on_phase_start(phase, run_id);
        }
    }

    fn on_phase_end(&self, phase: Phase, run_id: &str, outcome: &PhaseOutcome) {
        for observer in &self.observers {
            observer.on_phase_end(phase, run_id, outcome);
        }
    }

    fn on_progress(&self, run_id: &str, progress: &DrainProgress) {
        for observer in &self.observers {
            observer.on_progress(run_id, progress);
        }
    }

    fn on_advisory(&self, message: &str) {
        for observer in &self.observers {
            observer.on_advisory(message);
        }
    }

    fn on_state_change(&self, from: WorkflowState, to: WorkflowState) {
        for observer in &self.observers {
            observer.on_state_change(from, to);
        }
    }
}
