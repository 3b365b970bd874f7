//! Library error type and its exit-code mapping

use crate::exit_codes::ExitCode;
use crate::rules::RuleError;
use crate::store::StoreError;
use crate::workflow::WorkflowState;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("No collectors selected")]
    NoCollectors,

    #[error("No monitors selected")]
    NoMonitors,

    #[error("Invalid run id '{run_id}': {reason}")]
    InvalidRunId { run_id: String, reason: String },

    #[error("Run '{0}' already exists (use --overwrite to replace it)")]
    DuplicateRunId(String),

    #[error("Rule set from {rules_source} has {count} violation(s)")]
    InvalidRules { count: usize, rules_source: String },

    #[error(transparent)]
    RuleLoad(#[from] RuleError),

    #[error("Collector '{collector}' failed: {message}")]
    CollectorFault { collector: String, message: String },

    #[error("Monitor '{monitor}' failed: {message}")]
    MonitorFault { monitor: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to commit run '{run_id}': {source}")]
    CommitFailed {
        run_id: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Failed to start classification pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Illegal workflow transition from {from} to {to}")]
    IllegalTransition { from: WorkflowState, to: WorkflowState },
}

impl ScanError {
    pub fn invalid_run_id(run_id: &str, reason: impl Into<String>) -> Self {
        ScanError::InvalidRunId {
            run_id: run_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            ScanError::NoCollectors | ScanError::NoMonitors => ExitCode::NoCollectors,
            ScanError::InvalidRunId { .. } => ExitCode::InvalidRunId,
            ScanError::DuplicateRunId(_) => ExitCode::DuplicateRunId,
            ScanError::InvalidRules { .. } => ExitCode::InvalidRules,
            ScanError::RuleLoad(_) => ExitCode::RuleLoadFailed,
            ScanError::Cancelled => ExitCode::Cancelled,
            ScanError::CommitFailed { .. } => ExitCode::CommitFailed,
            ScanError::Store(StoreError::RunNotFound(_)) => ExitCode::InvalidRunId,
            ScanError::Store(StoreError::DuplicateRun(_)) => ExitCode::DuplicateRunId,
            ScanError::Store(StoreError::Commit(_)) => ExitCode::CommitFailed,
            ScanError::Export(_) => ExitCode::ExportFailed,
            ScanError::Store(_)
            | ScanError::CollectorFault { .. }
            | ScanError::MonitorFault { .. }
            | ScanError::ThreadPool(_)
            | ScanError::IllegalTransition { .. } => ExitCode::GenericFailure,
        }
    }
}
