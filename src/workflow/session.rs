//! Run identifiers and the guided session accumulator

use crate::constants::{GUIDED_AFTER_SUFFIX, GUIDED_BASELINE_SUFFIX, GUIDED_MONITORING_SUFFIX};
use crate::error::ScanError;
use crate::models::{generate_run_id, ResultSet};

/// Check a caller supplied run id, returning it trimmed
pub fn validate_run_id(run_id: &str) -> Result<String, ScanError> {
    let trimmed = run_id.trim();
    if trimmed.is_empty() {
        return Err(ScanError::invalid_run_id(run_id, "run id is empty"));
    }
    if trimmed.contains(['/', '\\']) {
        return Err(ScanError::invalid_run_id(run_id, "run id may not contain path separators"));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(ScanError::invalid_run_id(run_id, "run id may not contain control characters"));
    }
    Ok(trimmed.to_string())
}

/// The three run ids of one guided invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidedRunIds {
    pub base: String,
    pub baseline: String,
    pub after: String,
    pub monitoring: String,
}

impl GuidedRunIds {
    /// Derive `<base>-baseline`, `<base>-after` and `<base>-monitoring`.
    /// A missing or blank base defaults to the current timestamp.
    pub fn derive(base: Option<&str>) -> Result<Self, ScanError> {
        let base = match base.map(str::trim).filter(|b| !b.is_empty()) {
            Some(base) => validate_run_id(base)?,
            None => generate_run_id(),
        };
        Ok(Self {
            baseline: format!("{}-{}", base, GUIDED_BASELINE_SUFFIX),
            after: format!("{}-{}", base, GUIDED_AFTER_SUFFIX),
            monitoring: format!("{}-{}", base, GUIDED_MONITORING_SUFFIX),
            base,
        })
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.baseline, &self.after, &self.monitoring]
    }
}

/// Lives for one guided invocation and accumulates the merged results
#[derive(Debug)]
pub struct GuidedSession {
    ids: GuidedRunIds,
    results: ResultSet,
}

impl GuidedSession {
    pub fn new(ids: GuidedRunIds) -> Self {
        Self {
            ids,
            results: ResultSet::new(),
        }
    }

    pub fn ids(&self) -> &GuidedRunIds {
        &self.ids
    }

    /// Merge another phase's results; groups already present are kept
    pub fn merge(&mut self, results: ResultSet) {
        self.results.merge_primary(results);
    }

    pub fn results(&self) -> &ResultSet {
        &self.results
    }

    pub fn into_results(self) -> ResultSet {
        self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeRecord, ChangeType, CollectObject, GroupKey, ResultType};

    #[test]
    fn test_derive_from_base() {
        let ids = GuidedRunIds::derive(Some("2024-01-01T00:00:00")).unwrap();
        assert_eq!(ids.baseline, "2024-01-01T00:00:00-baseline");
        assert_eq!(ids.after, "2024-01-01T00:00:00-after");
        assert_eq!(ids.monitoring, "2024-01-01T00:00:00-monitoring");
        assert_eq!(ids.all().len(), 3);
    }

    #[test]
    fn test_derive_trims_and_defaults() {
        let ids = GuidedRunIds::derive(Some("  scan  ")).unwrap();
        assert_eq!(ids.base, "scan");
        assert_eq!(ids.after, "scan-after");

        let generated = GuidedRunIds::derive(Some("   ")).unwrap();
        assert!(!generated.base.is_empty());
        assert!(generated.baseline.ends_with("-baseline"));
        assert!(GuidedRunIds::derive(None).unwrap().monitoring.ends_with("-monitoring"));
    }

    #[test]
    fn test_invalid_run_ids() {
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("a/b").is_err());
        assert!(validate_run_id("a\\b").is_err());
        assert!(validate_run_id("a\nb").is_err());
        assert_eq!(validate_run_id(" ok ").unwrap(), "ok");
        assert!(GuidedRunIds::derive(Some("x/y")).is_err());
    }

    #[test]
    fn test_session_merge_keeps_first_writer() {
        let mut session = GuidedSession::new(GuidedRunIds::derive(Some("s")).unwrap());
        let x = ChangeRecord::created(CollectObject::new(ResultType::File, "x"), Some("s-baseline"), "s-after");
        let y = ChangeRecord::created(CollectObject::new(ResultType::File, "y"), None, "s-monitoring");
        let z = ChangeRecord::created(CollectObject::new(ResultType::Port, "z"), None, "s-monitoring");

        session.merge(ResultSet::from_records(vec![x]));
        session.merge(ResultSet::from_records(vec![y, z]));

        let files = session.results().get(&GroupKey::new(ResultType::File, ChangeType::Created)).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].record.identity(), "x");
        assert!(session.results().contains_key(&GroupKey::new(ResultType::Port, ChangeType::Created)));
    }
}
