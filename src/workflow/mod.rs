//! Scan workflow coordination
//!
//! Handles:
//! - Single collect and monitor phases with transaction, rollback and drain
//! - Compare and monitor-export with optional analysis, persistence and export
//! - Guided mode: baseline collect, monitor, after collect, compare, merge, export

pub mod session;
pub mod state;

pub use session::{validate_run_id, GuidedRunIds, GuidedSession};
pub use state::{StateMachine, WorkflowState};

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::analysis::{AnalysisStatus, Analyzer, AnalyzerOptions};
use crate::cancel::{CancellationToken, WaitOutcome};
use crate::collectors::Collector;
use crate::drain::{DrainOutcome, DrainSettings, FlushCoordinator};
use crate::error::ScanError;
use crate::export::{ExportContext, Exporter};
use crate::models::{ResultSet, ResultType, Run, RunType};
use crate::monitor::{EventSink, Monitor};
use crate::observer::{NullObserver, Phase, PhaseObserver, PhaseOutcome};
use crate::rules::RuleSource;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    /// Generated from the current time when absent
    pub run_id: Option<String>,
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MonitorOptions {
    pub run_id: Option<String>,
    pub overwrite: bool,
    /// Monitor until interrupted when absent
    pub duration: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct AnalysisOptions {
    pub rules: RuleSource,
    pub analyzer: AnalyzerOptions,
    /// Store classified results alongside the runs
    pub persist_results: bool,
}

#[derive(Clone)]
pub struct ExportRequest {
    pub exporter: Arc<dyn Exporter>,
    pub output_dir: PathBuf,
    pub exploded: bool,
}

#[derive(Clone, Default)]
pub struct CompareOptions {
    /// Compare against an empty base when absent
    pub first_run_id: Option<String>,
    pub second_run_id: String,
    pub analysis: Option<AnalysisOptions>,
    pub export: Option<ExportRequest>,
}

#[derive(Clone, Default)]
pub struct ExportMonitorOptions {
    pub run_id: String,
    pub analysis: Option<AnalysisOptions>,
    pub export: Option<ExportRequest>,
}

#[derive(Clone, Default)]
pub struct GuidedOptions {
    pub base_id: Option<String>,
    pub overwrite: bool,
    pub monitor_duration: Option<Duration>,
    pub analysis: AnalysisOptions,
    pub export: Option<ExportRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseReport {
    pub run_id: String,
    pub run_type: RunType,
    pub objects_written: usize,
    pub drain: DrainOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareReport {
    pub first_run_id: Option<String>,
    pub second_run_id: String,
    pub results: ResultSet,
    pub analysis: Option<AnalysisStatus>,
    pub exported: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuidedReport {
    pub run_ids: GuidedRunIds,
    pub baseline: PhaseReport,
    pub monitoring: PhaseReport,
    pub after: PhaseReport,
    pub compare: CompareReport,
}

/// Drives phases against one store. Not reentrant: one command at a time.
pub struct ScanCoordinator {
    store: Arc<dyn Store>,
    observer: Arc<dyn PhaseObserver>,
    token: CancellationToken,
    flush: FlushCoordinator,
    machine: StateMachine,
}

impl ScanCoordinator {
    pub fn new(store: Arc<dyn Store>, token: CancellationToken) -> Self {
        Self {
            store,
            observer: Arc::new(NullObserver),
            token,
            flush: FlushCoordinator::default(),
            machine: StateMachine::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PhaseObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_drain_settings(mut self, settings: DrainSettings) -> Self {
        self.flush = FlushCoordinator::new(settings);
        self
    }

    pub fn state(&self) -> WorkflowState {
        self.machine.state()
    }

    pub fn history(&self) -> &[WorkflowState] {
        self.machine.history()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run one collect phase
    pub fn collect(
        &mut self,
        collectors: &mut [Box<dyn Collector>],
        options: &CollectOptions,
    ) -> Result<PhaseReport, ScanError> {
        self.begin_command()?;
        let result = self.collect_command(collectors, options);
        self.finish_command(result)
    }

    fn collect_command(
        &mut self,
        collectors: &mut [Box<dyn Collector>],
        options: &CollectOptions,
    ) -> Result<PhaseReport, ScanError> {
        if collectors.is_empty() {
            return Err(ScanError::NoCollectors);
        }
        let run_id = resolve_run_id(options.run_id.as_deref())?;
        self.check_run_id(&run_id, options.overwrite)?;

        self.transition(WorkflowState::BaselineCollecting)?;
        let report = self.collect_phase(collectors, &run_id, options.overwrite)?;
        self.transition(WorkflowState::Done)?;
        Ok(report)
    }

    /// Run one monitor phase
    pub fn monitor(
        &mut self,
        monitors: &mut [Box<dyn Monitor>],
        options: &MonitorOptions,
    ) -> Result<PhaseReport, ScanError> {
        self.begin_command()?;
        let result = self.monitor_command(monitors, options);
        self.finish_command(result)
    }

    fn monitor_command(
        &mut self,
        monitors: &mut [Box<dyn Monitor>],
        options: &MonitorOptions,
    ) -> Result<PhaseReport, ScanError> {
        if monitors.is_empty() {
            return Err(ScanError::NoMonitors);
        }
        let run_id = resolve_run_id(options.run_id.as_deref())?;
        self.check_run_id(&run_id, options.overwrite)?;

        self.transition(WorkflowState::Monitoring)?;
        let report = self.monitor_phase(monitors, &run_id, options.overwrite, options.duration)?;
        self.transition(WorkflowState::Done)?;
        Ok(report)
    }

    /// Compare two runs (or one run against nothing), then analyze and export
    pub fn compare(&mut self, options: &CompareOptions) -> Result<CompareReport, ScanError> {
        self.begin_command()?;
        let result = self.compare_command(options);
        self.finish_command(result)
    }

    fn compare_command(&mut self, options: &CompareOptions) -> Result<CompareReport, ScanError> {
        let first = options.first_run_id.as_deref();
        let second = options.second_run_id.as_str();
        if let Some(first) = first {
            self.require_run(first, None)?;
        }
        self.require_run(second, None)?;

        let analyzer = options.analysis.as_ref().map(build_analyzer).transpose()?;

        self.transition(WorkflowState::Comparing)?;
        let mut results = self.compare_phase(first, second)?;
        let analysis = match (&analyzer, &options.analysis) {
            (Some(analyzer), Some(analysis)) => {
                Some(self.analyze_phase(analyzer, &mut results, first, second, analysis.persist_results)?)
            }
            _ => None,
        };

        let exported = match &options.export {
            Some(request) => self.export_phase(request, first, second, &results, analysis.clone())?,
            None => Vec::new(),
        };
        self.transition(WorkflowState::Done)?;

        Ok(CompareReport {
            first_run_id: first.map(str::to_string),
            second_run_id: second.to_string(),
            results,
            analysis,
            exported,
        })
    }

    /// Turn a monitor run's events into results, then analyze and export
    pub fn export_monitor(&mut self, options: &ExportMonitorOptions) -> Result<CompareReport, ScanError> {
        self.begin_command()?;
        let result = self.export_monitor_command(options);
        self.finish_command(result)
    }

    fn export_monitor_command(&mut self, options: &ExportMonitorOptions) -> Result<CompareReport, ScanError> {
        let run_id = options.run_id.as_str();
        self.require_run(run_id, Some(RunType::Monitor))?;
        let analyzer = options.analysis.as_ref().map(build_analyzer).transpose()?;

        self.transition(WorkflowState::Comparing)?;
        let mut results = self.monitored_phase(run_id)?;
        let analysis = match (&analyzer, &options.analysis) {
            (Some(analyzer), Some(analysis)) => {
                Some(self.analyze_phase(analyzer, &mut results, None, run_id, analysis.persist_results)?)
            }
            _ => None,
        };

        let exported = match &options.export {
            Some(request) => self.export_phase(request, None, run_id, &results, analysis.clone())?,
            None => Vec::new(),
        };
        self.transition(WorkflowState::Done)?;

        Ok(CompareReport {
            first_run_id: None,
            second_run_id: run_id.to_string(),
            results,
            analysis,
            exported,
        })
    }

    /// Baseline collect, monitor, after collect, then compare and merge
    pub fn guided(
        &mut self,
        collectors: &mut [Box<dyn Collector>],
        monitors: &mut [Box<dyn Monitor>],
        options: &GuidedOptions,
    ) -> Result<GuidedReport, ScanError> {
        self.begin_command()?;
        let result = self.guided_command(collectors, monitors, options);
        self.finish_command(result)
    }

    fn guided_command(
        &mut self,
        collectors: &mut [Box<dyn Collector>],
        monitors: &mut [Box<dyn Monitor>],
        options: &GuidedOptions,
    ) -> Result<GuidedReport, ScanError> {
        if collectors.is_empty() {
            return Err(ScanError::NoCollectors);
        }
        if monitors.is_empty() {
            return Err(ScanError::NoMonitors);
        }

        // Everything that can be rejected is checked before the first write
        let ids = GuidedRunIds::derive(options.base_id.as_deref())?;
        for run_id in ids.all() {
            self.check_run_id(run_id, options.overwrite)?;
        }
        let analyzer = build_analyzer(&options.analysis)?;
        if !analyzer.is_valid() {
            return Err(ScanError::InvalidRules {
                count: analyzer.violations().len(),
                rules_source: analyzer.source().to_string(),
            });
        }
        log::info!(
            "Guided scan {} using runs {}, {} and {}",
            ids.base,
            ids.baseline,
            ids.monitoring,
            ids.after
        );

        self.transition(WorkflowState::BaselineCollecting)?;
        let baseline = self.collect_phase(collectors, &ids.baseline, options.overwrite)?;
        ensure_drained(&baseline)?;

        self.transition(WorkflowState::Monitoring)?;
        let monitoring = self.monitor_phase(monitors, &ids.monitoring, options.overwrite, options.monitor_duration)?;
        ensure_drained(&monitoring)?;

        self.transition(WorkflowState::AfterCollecting)?;
        let after = self.collect_phase(collectors, &ids.after, options.overwrite)?;
        ensure_drained(&after)?;

        self.transition(WorkflowState::Comparing)?;
        let persist = options.analysis.persist_results;
        let mut session = GuidedSession::new(ids);

        let mut diff = self.compare_phase(Some(&session.ids().baseline), &session.ids().after)?;
        self.analyze_phase(
            &analyzer,
            &mut diff,
            Some(&session.ids().baseline),
            &session.ids().after,
            persist,
        )?;

        let mut monitored = self.monitored_phase(&session.ids().monitoring)?;
        self.analyze_phase(&analyzer, &mut monitored, None, &session.ids().monitoring, persist)?;

        session.merge(diff);
        session.merge(monitored);

        let ids = session.ids().clone();
        let results = session.into_results();
        // Rules were validated up front, so both result sets are classified
        let analysis = Some(AnalysisStatus::Analyzed { records: results.len() });

        let exported = match &options.export {
            Some(request) => self.export_phase(request, Some(&ids.baseline), &ids.after, &results, analysis.clone())?,
            None => Vec::new(),
        };
        self.transition(WorkflowState::Done)?;

        Ok(GuidedReport {
            compare: CompareReport {
                first_run_id: Some(ids.baseline.clone()),
                second_run_id: ids.after.clone(),
                results,
                analysis,
                exported,
            },
            run_ids: ids,
            baseline,
            monitoring,
            after,
        })
    }

    fn begin_command(&mut self) -> Result<(), ScanError> {
        if !self.machine.state().is_active() {
            self.machine.reset(self.observer.as_ref())?;
        }
        Ok(())
    }

    fn finish_command<T>(&mut self, result: Result<T, ScanError>) -> Result<T, ScanError> {
        if let Err(e) = &result {
            log::error!("{}", e);
            self.machine.fail(self.observer.as_ref());
        }
        result
    }

    fn transition(&mut self, next: WorkflowState) -> Result<(), ScanError> {
        self.machine.transition(next, self.observer.as_ref())
    }

    /// Reject ids that are malformed or taken (unless they will be overwritten)
    fn check_run_id(&self, run_id: &str, overwrite: bool) -> Result<(), ScanError> {
        validate_run_id(run_id)?;
        if !overwrite && self.store.get_run(run_id)?.is_some() {
            return Err(ScanError::DuplicateRunId(run_id.to_string()));
        }
        Ok(())
    }

    fn require_run(&self, run_id: &str, run_type: Option<RunType>) -> Result<Run, ScanError> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| ScanError::invalid_run_id(run_id, "no such run"))?;
        match run_type {
            Some(expected) if run.run_type != expected => Err(ScanError::invalid_run_id(
                run_id,
                format!("expected a {:?} run", expected).to_lowercase(),
            )),
            _ => Ok(run),
        }
    }

    fn rollback(&self, run_id: &str) {
        match self.store.rollback() {
            Ok(()) => log::warn!("Rolled back run {}", run_id),
            Err(e) => log::error!("Failed to roll back run {}: {}", run_id, e),
        }
    }

    /// Abort an open phase: roll back, report, and hand back the error
    fn abort(&self, phase: Phase, run_id: &str, error: ScanError) -> ScanError {
        self.rollback(run_id);
        let outcome = match &error {
            ScanError::Cancelled => PhaseOutcome::Cancelled,
            other => PhaseOutcome::Failed(other.to_string()),
        };
        self.observer.on_phase_end(phase, run_id, &outcome);
        error
    }

    /// Open a transaction staging `run`. With `overwrite`, an existing run of
    /// the same id is only replaced when this transaction commits.
    fn open_run(&self, run: &Run, overwrite: bool) -> Result<(), ScanError> {
        self.store.begin_transaction()?;
        let staged = if overwrite {
            self.store.replace_run(run).map(|replacing| {
                if replacing {
                    log::info!("Run {} will replace the existing run on commit", run.run_id);
                }
            })
        } else {
            self.store.insert_run(run)
        };
        if let Err(e) = staged {
            self.rollback(&run.run_id);
            return Err(e.into());
        }
        Ok(())
    }

    fn commit(&self, phase: Phase, run_id: &str) -> Result<(), ScanError> {
        if let Err(source) = self.store.commit() {
            self.observer.on_phase_end(phase, run_id, &PhaseOutcome::Failed(source.to_string()));
            return Err(ScanError::CommitFailed {
                run_id: run_id.to_string(),
                source,
            });
        }
        self.observer.on_phase_end(phase, run_id, &PhaseOutcome::Completed);
        Ok(())
    }

    fn collect_phase(
        &self,
        collectors: &mut [Box<dyn Collector>],
        run_id: &str,
        overwrite: bool,
    ) -> Result<PhaseReport, ScanError> {
        if collectors.is_empty() {
            return Err(ScanError::NoCollectors);
        }
        self.observer.on_phase_start(Phase::Collect, run_id);

        let result_types: BTreeSet<ResultType> = collectors.iter().flat_map(|c| c.result_types()).collect();
        self.open_run(&Run::new(run_id, RunType::Collect, result_types), overwrite)?;

        let mut written = 0usize;
        for collector in collectors.iter_mut() {
            if self.token.is_cancelled() {
                break;
            }
            log::info!("Running collector {} for run {}", collector.name(), run_id);

            let mut write_error: Option<StoreError> = None;
            let result = {
                let store = &self.store;
                let mut sink = |object| {
                    if write_error.is_some() {
                        return;
                    }
                    match store.write(run_id, object) {
                        Ok(()) => written += 1,
                        Err(e) => write_error = Some(e),
                    }
                };
                collector.start_run(&self.token, &mut sink)
            };
            collector.stop_run();

            if let Err(e) = result {
                if self.token.is_cancelled() {
                    break;
                }
                log::error!("Collector {} failed: {:#}", collector.name(), e);
                let fault = ScanError::CollectorFault {
                    collector: collector.name().to_string(),
                    message: format!("{:#}", e),
                };
                return Err(self.abort(Phase::Collect, run_id, fault));
            }
            if let Some(e) = write_error {
                return Err(self.abort(Phase::Collect, run_id, e.into()));
            }
        }

        if self.token.is_cancelled() {
            return Err(self.abort(Phase::Collect, run_id, ScanError::Cancelled));
        }

        self.commit(Phase::Collect, run_id)?;
        log::info!("Committed run {} with {} object(s)", run_id, written);
        let drain = self.drain_phase(run_id);

        Ok(PhaseReport {
            run_id: run_id.to_string(),
            run_type: RunType::Collect,
            objects_written: written,
            drain,
        })
    }

    fn monitor_phase(
        &self,
        monitors: &mut [Box<dyn Monitor>],
        run_id: &str,
        overwrite: bool,
        duration: Option<Duration>,
    ) -> Result<PhaseReport, ScanError> {
        if monitors.is_empty() {
            return Err(ScanError::NoMonitors);
        }
        self.observer.on_phase_start(Phase::Monitor, run_id);

        let result_types: BTreeSet<ResultType> = monitors.iter().flat_map(|m| m.result_types()).collect();
        self.open_run(&Run::new(run_id, RunType::Monitor, result_types), overwrite)?;

        let written = Arc::new(AtomicUsize::new(0));
        let write_error: Arc<Mutex<Option<StoreError>>> = Arc::new(Mutex::new(None));
        let sink: EventSink = {
            let store = Arc::clone(&self.store);
            let written = Arc::clone(&written);
            let write_error = Arc::clone(&write_error);
            let run_id = run_id.to_string();
            Arc::new(move |event| match store.write_event(&run_id, event) {
                Ok(()) => {
                    written.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    if let Ok(mut slot) = write_error.lock() {
                        slot.get_or_insert(e);
                    }
                }
            })
        };

        let stop = self.token.arm_stop();
        let mut started = 0;
        let mut fault = None;
        for monitor in monitors.iter_mut() {
            if let Err(e) = monitor.start_run(&self.token, Arc::clone(&sink)) {
                log::error!("Monitor {} failed to start: {:#}", monitor.name(), e);
                fault = Some(ScanError::MonitorFault {
                    monitor: monitor.name().to_string(),
                    message: format!("{:#}", e),
                });
                break;
            }
            started += 1;
        }

        let outcome = match fault {
            Some(_) => WaitOutcome::Stopped,
            None => {
                match duration {
                    Some(d) => log::info!("Monitoring run {} for {:.1}s", run_id, d.as_secs_f64()),
                    None => log::info!("Monitoring run {} until interrupted", run_id),
                }
                self.token.wait(duration, Some(&stop))
            }
        };
        drop(stop);

        for monitor in monitors[..started].iter_mut() {
            if let Err(e) = monitor.stop_run() {
                log::error!("Monitor {} failed to stop: {:#}", monitor.name(), e);
                fault.get_or_insert(ScanError::MonitorFault {
                    monitor: monitor.name().to_string(),
                    message: format!("{:#}", e),
                });
            }
        }

        if let Some(fault) = fault {
            return Err(self.abort(Phase::Monitor, run_id, fault));
        }
        if outcome == WaitOutcome::Cancelled {
            return Err(self.abort(Phase::Monitor, run_id, ScanError::Cancelled));
        }
        let write_error = write_error.lock().ok().and_then(|mut slot| slot.take());
        if let Some(e) = write_error {
            return Err(self.abort(Phase::Monitor, run_id, e.into()));
        }

        self.commit(Phase::Monitor, run_id)?;
        let written = written.load(Ordering::SeqCst);
        log::info!("Committed run {} with {} event(s)", run_id, written);
        let drain = self.drain_phase(run_id);

        Ok(PhaseReport {
            run_id: run_id.to_string(),
            run_type: RunType::Monitor,
            objects_written: written,
            drain,
        })
    }

    fn drain_phase(&self, run_id: &str) -> DrainOutcome {
        self.observer.on_phase_start(Phase::Drain, run_id);
        let outcome = self
            .flush
            .drain(self.store.as_ref(), run_id, &self.token, self.observer.as_ref());
        let phase_outcome = match outcome {
            DrainOutcome::Drained { .. } => PhaseOutcome::Completed,
            DrainOutcome::Cancelled { .. } => PhaseOutcome::Cancelled,
        };
        self.observer.on_phase_end(Phase::Drain, run_id, &phase_outcome);
        outcome
    }

    fn compare_phase(&self, first: Option<&str>, second: &str) -> Result<ResultSet, ScanError> {
        self.observer.on_phase_start(Phase::Compare, second);
        match self.store.compare(first, second) {
            Ok(results) => {
                log::info!(
                    "Compared {} to {}: {} change(s) in {} group(s)",
                    first.unwrap_or("<empty>"),
                    second,
                    results.len(),
                    results.group_count()
                );
                self.observer.on_phase_end(Phase::Compare, second, &PhaseOutcome::Completed);
                Ok(results)
            }
            Err(e) => {
                self.observer
                    .on_phase_end(Phase::Compare, second, &PhaseOutcome::Failed(e.to_string()));
                Err(e.into())
            }
        }
    }

    fn monitored_phase(&self, run_id: &str) -> Result<ResultSet, ScanError> {
        self.observer.on_phase_start(Phase::Compare, run_id);
        let events = self.store.get_monitor_events(run_id)?;
        let results = Analyzer::monitored_records(run_id, events);
        self.observer.on_phase_end(Phase::Compare, run_id, &PhaseOutcome::Completed);
        Ok(results)
    }

    fn analyze_phase(
        &self,
        analyzer: &Analyzer,
        results: &mut ResultSet,
        first: Option<&str>,
        second: &str,
        persist: bool,
    ) -> Result<AnalysisStatus, ScanError> {
        self.observer.on_phase_start(Phase::Analyze, second);
        let status = analyzer.analyze(results);
        match &status {
            AnalysisStatus::Analyzed { records } => {
                log::info!("Classified {} record(s) of {}", records, second);
                self.observer.on_phase_end(Phase::Analyze, second, &PhaseOutcome::Completed);
            }
            AnalysisStatus::Skipped { violations, rules_source } => {
                let reason = format!("{} rule violation(s) in {}", violations, rules_source);
                log::warn!("Skipping analysis of {}: {}", second, reason);
                self.observer.on_phase_end(Phase::Analyze, second, &PhaseOutcome::Skipped(reason));
            }
        }

        if persist && matches!(status, AnalysisStatus::Analyzed { .. }) {
            self.observer.on_phase_start(Phase::Persist, second);
            if let Err(e) = self.store.insert_results(first, second, results) {
                self.observer
                    .on_phase_end(Phase::Persist, second, &PhaseOutcome::Failed(e.to_string()));
                return Err(e.into());
            }
            self.observer.on_phase_end(Phase::Persist, second, &PhaseOutcome::Completed);
        }
        Ok(status)
    }

    fn export_phase(
        &mut self,
        request: &ExportRequest,
        first: Option<&str>,
        second: &str,
        results: &ResultSet,
        analysis: Option<AnalysisStatus>,
    ) -> Result<Vec<PathBuf>, ScanError> {
        self.transition(WorkflowState::Exporting)?;
        self.observer.on_phase_start(Phase::Export, second);

        let context = ExportContext::new(first, second, &request.output_dir, request.exploded).with_analysis(analysis);
        match request.exporter.export(&context, results) {
            Ok(paths) => {
                self.observer.on_phase_end(Phase::Export, second, &PhaseOutcome::Completed);
                Ok(paths)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.observer
                    .on_phase_end(Phase::Export, second, &PhaseOutcome::Failed(message.clone()));
                Err(ScanError::Export(message))
            }
        }
    }
}

fn resolve_run_id(run_id: Option<&str>) -> Result<String, ScanError> {
    match run_id {
        Some(run_id) => validate_run_id(run_id),
        None => Ok(crate::models::generate_run_id()),
    }
}

/// Load and validate a rule set for one analysis phase
fn build_analyzer(options: &AnalysisOptions) -> Result<Analyzer, ScanError> {
    let rules = options.rules.load()?;
    Ok(Analyzer::new(rules, options.rules.clone(), options.analyzer.clone())?)
}

/// A guided phase whose drain was cancelled ends the sequence
fn ensure_drained(report: &PhaseReport) -> Result<(), ScanError> {
    match report.drain {
        DrainOutcome::Drained { .. } => Ok(()),
        DrainOutcome::Cancelled { remaining } => {
            log::warn!(
                "Run {} is committed but {} write(s) were still queued when cancelled",
                report.run_id,
                remaining
            );
            Err(ScanError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CollectObject;
    use crate::store::MemoryStore;
    use anyhow::bail;

    struct Fixed(Vec<&'static str>);

    impl Collector for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn result_types(&self) -> BTreeSet<ResultType> {
            BTreeSet::from([ResultType::File])
        }

        fn start_run(&mut self, _token: &CancellationToken, sink: &mut dyn FnMut(CollectObject)) -> anyhow::Result<()> {
            for path in &self.0 {
                sink(CollectObject::new(ResultType::File, *path).with_attribute("path", *path));
            }
            Ok(())
        }
    }

    struct Broken;

    impl Collector for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn result_types(&self) -> BTreeSet<ResultType> {
            BTreeSet::from([ResultType::Port])
        }

        fn start_run(&mut self, _token: &CancellationToken, sink: &mut dyn FnMut(CollectObject)) -> anyhow::Result<()> {
            sink(CollectObject::new(ResultType::Port, "22"));
            bail!("socket table unavailable")
        }
    }

    fn coordinator() -> ScanCoordinator {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::in_memory(2).unwrap());
        ScanCoordinator::new(store, CancellationToken::new()).with_drain_settings(DrainSettings {
            poll_interval: Duration::from_millis(5),
            ..DrainSettings::default()
        })
    }

    fn collect(coordinator: &mut ScanCoordinator, run_id: &str, paths: Vec<&'static str>) -> PhaseReport {
        let mut collectors: Vec<Box<dyn Collector>> = vec![Box::new(Fixed(paths))];
        let options = CollectOptions {
            run_id: Some(run_id.to_string()),
            overwrite: false,
        };
        coordinator.collect(&mut collectors, &options).unwrap()
    }

    #[test]
    fn test_collect_commits_and_drains() {
        let mut coordinator = coordinator();
        let report = collect(&mut coordinator, "a", vec!["/x", "/y"]);

        assert_eq!(report.objects_written, 2);
        assert!(matches!(report.drain, DrainOutcome::Drained { .. }));
        assert_eq!(coordinator.state(), WorkflowState::Done);
        assert!(coordinator.store().get_run("a").unwrap().is_some());
    }

    #[test]
    fn test_duplicate_run_id_rejected_before_mutation() {
        let mut coordinator = coordinator();
        collect(&mut coordinator, "a", vec!["/x"]);

        let mut collectors: Vec<Box<dyn Collector>> = vec![Box::new(Fixed(vec!["/z"]))];
        let options = CollectOptions {
            run_id: Some("a".to_string()),
            overwrite: false,
        };
        let err = coordinator.collect(&mut collectors, &options).unwrap_err();
        assert!(matches!(err, ScanError::DuplicateRunId(_)));
        assert_eq!(coordinator.store().compare(None, "a").unwrap().len(), 1);

        let overwrite = CollectOptions {
            overwrite: true,
            ..options
        };
        coordinator.collect(&mut collectors, &overwrite).unwrap();
        let results = coordinator.store().compare(None, "a").unwrap();
        assert_eq!(results.iter().next().unwrap().record.identity(), "/z");
    }

    #[test]
    fn test_collector_fault_rolls_back_and_fails() {
        let mut coordinator = coordinator();
        let mut collectors: Vec<Box<dyn Collector>> = vec![Box::new(Broken), Box::new(Fixed(vec!["/x"]))];
        let options = CollectOptions {
            run_id: Some("bad".to_string()),
            overwrite: false,
        };

        let err = coordinator.collect(&mut collectors, &options).unwrap_err();
        match err {
            ScanError::CollectorFault { collector, .. } => assert_eq!(collector, "broken"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(coordinator.state(), WorkflowState::Failed);
        assert!(coordinator.store().get_run("bad").unwrap().is_none());

        // The next command starts from a clean machine
        collect(&mut coordinator, "good", vec!["/x"]);
        assert_eq!(coordinator.state(), WorkflowState::Done);
    }

    #[test]
    fn test_no_collectors() {
        let mut coordinator = coordinator();
        let err = coordinator.collect(&mut [], &CollectOptions::default()).unwrap_err();
        assert!(matches!(err, ScanError::NoCollectors));
    }

    #[test]
    fn test_compare_and_analyze() {
        let mut coordinator = coordinator();
        collect(&mut coordinator, "before", vec!["/x"]);
        collect(&mut coordinator, "after", vec!["/x", "/tmp/evil"]);

        let report = coordinator
            .compare(&CompareOptions {
                first_run_id: Some("before".to_string()),
                second_run_id: "after".to_string(),
                analysis: Some(AnalysisOptions::default()),
                export: None,
            })
            .unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(report.analysis, Some(AnalysisStatus::Analyzed { records: 1 }));
        assert!(report.results.is_fully_classified());
        assert_eq!(
            coordinator.history(),
            &[
                WorkflowState::Idle,
                WorkflowState::BaselineCollecting,
                WorkflowState::Done,
                WorkflowState::Idle,
                WorkflowState::BaselineCollecting,
                WorkflowState::Done,
                WorkflowState::Idle,
                WorkflowState::Comparing,
                WorkflowState::Done,
            ]
        );
    }

    #[test]
    fn test_compare_unknown_run() {
        let mut coordinator = coordinator();
        let err = coordinator
            .compare(&CompareOptions {
                second_run_id: "missing".to_string(),
                ..CompareOptions::default()
            })
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidRunId { .. }));
    }

    #[test]
    fn test_guided_requires_monitors() {
        let mut coordinator = coordinator();
        let mut collectors: Vec<Box<dyn Collector>> = vec![Box::new(Fixed(vec!["/x"]))];
        let err = coordinator
            .guided(&mut collectors, &mut [], &GuidedOptions::default())
            .unwrap_err();
        assert!(matches!(err, ScanError::NoMonitors));
        assert!(coordinator.store().list_runs().unwrap().is_empty());
    }
}
