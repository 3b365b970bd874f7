//! Process exit codes
//!
//! Each failure class has its own status so scripts can branch on the code
//! without parsing output.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,

    /// Unclassified failure (I/O, store, collector or monitor fault)
    GenericFailure = 1,

    /// No collectors (or monitors) were selected for a phase that needs them
    NoCollectors = 2,

    /// A run id is malformed or names a run that does not exist
    InvalidRunId = 3,

    /// A run id is already in use and overwrite was not requested
    DuplicateRunId = 4,

    /// The rule set failed validation
    InvalidRules = 5,

    /// The operation was cancelled
    Cancelled = 6,

    /// The store failed to commit a phase
    CommitFailed = 7,

    /// The rule file could not be read or parsed
    RuleLoadFailed = 8,

    /// Writing export files failed
    ExportFailed = 9,

    /// Invalid command line arguments
    ArgsError = 10,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Success
    }

    /// Name used in JSON output
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Success => "OK",
            ExitCode::GenericFailure => "ERR_FAILURE",
            ExitCode::NoCollectors => "ERR_NO_COLLECTORS",
            ExitCode::InvalidRunId => "ERR_INVALID_RUN_ID",
            ExitCode::DuplicateRunId => "ERR_DUPLICATE_RUN_ID",
            ExitCode::InvalidRules => "ERR_INVALID_RULES",
            ExitCode::Cancelled => "ERR_CANCELLED",
            ExitCode::CommitFailed => "ERR_COMMIT",
            ExitCode::RuleLoadFailed => "ERR_RULE_LOAD",
            ExitCode::ExportFailed => "ERR_EXPORT",
            ExitCode::ArgsError => "ERR_ARGS",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ALL: [ExitCode; 11] = [
        ExitCode::Success,
        ExitCode::GenericFailure,
        ExitCode::NoCollectors,
        ExitCode::InvalidRunId,
        ExitCode::DuplicateRunId,
        ExitCode::InvalidRules,
        ExitCode::Cancelled,
        ExitCode::CommitFailed,
        ExitCode::RuleLoadFailed,
        ExitCode::ExportFailed,
        ExitCode::ArgsError,
    ];

    #[test]
    fn test_codes_are_distinct() {
        let codes: HashSet<i32> = ALL.iter().map(|c| c.as_i32()).collect();
        assert_eq!(codes.len(), ALL.len());
        let names: HashSet<&str> = ALL.iter().map(|c| c.code_name()).collect();
        assert_eq!(names.len(), ALL.len());
    }

    #[test]
    fn test_only_success_is_zero() {
        for code in ALL {
            assert_eq!(code.is_success(), code.as_i32() == 0);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitCode::Cancelled.to_string(), "ERR_CANCELLED (6)");
        assert_eq!(i32::from(ExitCode::ArgsError), 10);
    }
}
