//! Rule model and loading
//!
//! Handles:
//! - Rule and RuleSet definitions (JSON)
//! - Loading the embedded default rule set or a rule file
//! - Prefiltering rules down to those applicable to a record's category
//! - Structural validation of rule conditions

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::EMBEDDED_RULES_SOURCE;
use crate::models::{ChangeType, Platform, ResultType, Severity};

pub mod condition;
pub mod expression;
pub mod validate;

pub use condition::{Clause, ClauseEvaluator, Condition, ConditionEvaluator, Operation};
pub use validate::{validate_rule, validate_rule_set, Violation};

const DEFAULT_RULES: &str = include_str!("default_rules.json");

/// Category default used when a rule set declares none for a category
const FALLBACK_LEVEL: Severity = Severity::Information;

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Failed to read rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse rules from {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A declarative classification rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "flag")]
    pub severity: Severity,
    pub result_type: ResultType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_types: Option<BTreeSet<ChangeType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<BTreeSet<Platform>>,
    #[serde(default)]
    pub condition: Condition,
}

impl Rule {
    /// Structural applicability: category, change type and platform restrictions
    pub fn applies_to(&self, result_type: ResultType, change_type: ChangeType, platform: Platform) -> bool {
        self.result_type == result_type
            && self
                .change_types
                .as_ref()
                .map_or(true, |types| types.contains(&change_type))
            && self
                .platforms
                .as_ref()
                .map_or(true, |platforms| platforms.contains(&platform))
    }
}

/// Rules for one analysis phase plus per-category default levels
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub default_levels: BTreeMap<ResultType, Severity>,
    #[serde(default)]
    pub rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            default_levels: BTreeMap::new(),
            rules: rules.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn with_default_level(mut self, result_type: ResultType, level: Severity) -> Self {
        self.default_levels.insert(result_type, level);
        self
    }

    /// The rule set compiled into the binary
    pub fn load_default() -> Result<Self, RuleError> {
        Self::from_json(DEFAULT_RULES, EMBEDDED_RULES_SOURCE)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, RuleError> {
        let content = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content, &path.display().to_string())
    }

    pub fn from_json(content: &str, origin: &str) -> Result<Self, RuleError> {
        serde_json::from_str(content).map_err(|source| RuleError::Parse {
            origin: origin.to_string(),
            source,
        })
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn default_level(&self, result_type: ResultType) -> Severity {
        self.default_levels
            .get(&result_type)
            .copied()
            .unwrap_or(FALLBACK_LEVEL)
    }
}

/// Where an analysis phase takes its rules from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RuleSource {
    #[default]
    Embedded,
    File(PathBuf),
}

impl RuleSource {
    pub fn from_option(path: Option<PathBuf>) -> Self {
        path.map_or(RuleSource::Embedded, RuleSource::File)
    }

    pub fn load(&self) -> Result<RuleSet, RuleError> {
        match self {
            RuleSource::Embedded => RuleSet::load_default(),
            RuleSource::File(path) => RuleSet::load_from_path(path),
        }
    }
}

impl fmt::Display for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSource::Embedded => f.write_str(EMBEDDED_RULES_SOURCE),
            RuleSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Narrow `rules` to those that can structurally apply to a record of the
/// given category, change type and platform. Order is preserved.
pub fn prefilter(
    rules: &[Arc<Rule>],
    result_type: ResultType,
    change_type: ChangeType,
    platform: Platform,
) -> Vec<Arc<Rule>> {
    rules
        .iter()
        .filter(|rule| rule.applies_to(result_type, change_type, platform))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, result_type: ResultType) -> Rule {
        Rule {
            name: name.to_string(),
            description: String::new(),
            severity: Severity::Low,
            result_type,
            change_types: None,
            platforms: None,
            condition: Condition::default(),
        }
    }

    #[test]
    fn test_prefilter_by_result_type() {
        let set = RuleSet::new(vec![rule("a", ResultType::File), rule("b", ResultType::Port)]);
        let applicable = prefilter(set.rules(), ResultType::File, ChangeType::Created, Platform::Linux);
        assert_eq!(applicable.len(), 1);
        assert_eq!(applicable[0].name, "a");
    }

    #[test]
    fn test_prefilter_change_type_restriction() {
        let mut restricted = rule("created-only", ResultType::File);
        restricted.change_types = Some([ChangeType::Created].into_iter().collect());
        let set = RuleSet::new(vec![restricted, rule("any", ResultType::File)]);

        let created = prefilter(set.rules(), ResultType::File, ChangeType::Created, Platform::Linux);
        assert_eq!(created.len(), 2);

        let deleted = prefilter(set.rules(), ResultType::File, ChangeType::Deleted, Platform::Linux);
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name, "any");
    }

    #[test]
    fn test_prefilter_platform_restriction() {
        let mut windows_only = rule("win", ResultType::Registry);
        windows_only.platforms = Some([Platform::Windows].into_iter().collect());
        let set = RuleSet::new(vec![windows_only]);

        assert!(prefilter(set.rules(), ResultType::Registry, ChangeType::Created, Platform::Linux).is_empty());
        assert_eq!(
            prefilter(set.rules(), ResultType::Registry, ChangeType::Created, Platform::Windows).len(),
            1
        );
    }

    #[test]
    fn test_default_level_fallback() {
        let set = RuleSet::default().with_default_level(ResultType::Port, Severity::Medium);
        assert_eq!(set.default_level(ResultType::Port), Severity::Medium);
        assert_eq!(set.default_level(ResultType::File), Severity::Information);
    }

    #[test]
    fn test_embedded_rules_load_and_validate() {
        let set = RuleSet::load_default().expect("embedded rules must parse");
        assert!(!set.rules().is_empty());
        let violations = validate_rule_set(&set);
        assert!(violations.is_empty(), "embedded rules have violations: {:?}", violations);
    }

    #[test]
    fn test_rule_accepts_flag_alias() {
        let json = r#"{
            "default_levels": {"FILE": "low"},
            "rules": [{
                "name": "aliased",
                "flag": "high",
                "result_type": "FILE",
                "condition": {"clauses": [{"field": "path", "operation": "is_null", "invert": true}]}
            }]
        }"#;
        let set = RuleSet::from_json(json, "inline").unwrap();
        assert_eq!(set.rules()[0].severity, Severity::High);
        assert_eq!(set.default_level(ResultType::File), Severity::Low);
    }

    #[test]
    fn test_load_from_missing_path_is_io_error() {
        let err = RuleSet::load_from_path(Path::new("/nonexistent/rules.json")).unwrap_err();
        assert!(matches!(err, RuleError::Io { .. }));
    }

    #[test]
    fn test_rule_source_display() {
        assert_eq!(RuleSource::Embedded.to_string(), "embedded");
        assert_eq!(RuleSource::File(PathBuf::from("/tmp/r.json")).to_string(), "/tmp/r.json");
    }
}
