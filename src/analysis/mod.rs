//! Differential analysis and classification
//!
//! Handles:
//! - Classifying one change record against the applicable rules
//! - Classifying whole result sets concurrently on a bounded thread pool
//! - Turning monitored events into change records

use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;

use crate::models::{ChangeRecord, Classification, MonitorEvent, Platform, ResultSet};
use crate::rules::{prefilter, validate_rule_set, ClauseEvaluator, ConditionEvaluator, Rule, RuleSet, RuleSource, Violation};

/// Matches change records against a rule set. Stateless per call, shareable across threads.
pub struct Classifier {
    rules: Arc<RuleSet>,
    evaluator: Arc<dyn ConditionEvaluator>,
    platform: Platform,
    apply_sub_object_rules: bool,
}

impl Classifier {
    pub fn new(rules: Arc<RuleSet>, evaluator: Arc<dyn ConditionEvaluator>, platform: Platform) -> Self {
        Self {
            rules,
            evaluator,
            platform,
            apply_sub_object_rules: true,
        }
    }

    /// Whether monitored file events are also classified through their file snapshot
    pub fn with_sub_object_rules(mut self, enabled: bool) -> Self {
        self.apply_sub_object_rules = enabled;
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn classify(&self, record: &ChangeRecord) -> Classification {
        let default_level = self.rules.default_level(record.result_type);
        let classification = Classification::resolve(self.matching_rules(record), default_level);

        if !self.apply_sub_object_rules {
            return classification;
        }
        match record.sub_object_record() {
            Some(inner) => classification.extend(self.matching_rules(&inner), default_level),
            None => classification,
        }
    }

    fn matching_rules(&self, record: &ChangeRecord) -> Vec<Arc<Rule>> {
        prefilter(self.rules.rules(), record.result_type, record.change_type, self.platform)
            .into_iter()
            .filter(|rule| self.evaluator.matches(&rule.condition, record))
            .collect()
    }
}

#[derive(Clone)]
pub struct AnalyzerOptions {
    /// Worker threads; `None` uses the available parallelism
    pub parallelism: Option<usize>,
    pub apply_sub_object_rules: bool,
    pub platform: Platform,
    pub evaluator: Arc<dyn ConditionEvaluator>,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        Self {
            parallelism: None,
            apply_sub_object_rules: true,
            platform: Platform::current(),
            evaluator: Arc::new(ClauseEvaluator::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisStatus {
    Analyzed { records: usize },
    /// The rule set failed validation; results were left unclassified
    Skipped { violations: usize, rules_source: String },
}

/// Classifies result sets in place with a validated rule set
pub struct Analyzer {
    classifier: Classifier,
    source: RuleSource,
    violations: Vec<Violation>,
    pool: rayon::ThreadPool,
}

impl Analyzer {
    /// Validates `rules` up front; an invalid set still builds an analyzer
    /// whose `analyze` skips.
    pub fn new(rules: RuleSet, source: RuleSource, options: AnalyzerOptions) -> Result<Self, rayon::ThreadPoolBuildError> {
        let violations = validate_rule_set(&rules);
        for violation in &violations {
            log::warn!("Rule violation in {}: {}", source, violation);
        }

        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|index| format!("classify-{}", index));
        if let Some(threads) = options.parallelism {
            builder = builder.num_threads(threads.max(1));
        }
        let pool = builder.build()?;

        let classifier = Classifier::new(Arc::new(rules), options.evaluator, options.platform)
            .with_sub_object_rules(options.apply_sub_object_rules);

        Ok(Self {
            classifier,
            source,
            violations,
            pool,
        })
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn source(&self) -> &RuleSource {
        &self.source
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Classify every record of every group, overwriting each entry in place
    pub fn analyze(&self, results: &mut ResultSet) -> AnalysisStatus {
        if !self.is_valid() {
            return AnalysisStatus::Skipped {
                violations: self.violations.len(),
                rules_source: self.source.to_string(),
            };
        }

        let classifier = &self.classifier;
        self.pool.install(|| {
            results.groups_mut().par_iter_mut().for_each(|(_, list)| {
                list.par_iter_mut().for_each(|entry| {
                    entry.classification = Some(classifier.classify(&entry.record));
                });
            });
        });

        AnalysisStatus::Analyzed {
            records: results.len(),
        }
    }

    /// Monitored events as change records with no base, grouped by their own key
    pub fn monitored_records(run_id: &str, events: Vec<MonitorEvent>) -> ResultSet {
        ResultSet::from_records(events.into_iter().map(|event| ChangeRecord::from_event(event, run_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ChangeType, CollectObject, FileSystemEvent, GenericEvent, GroupKey, ResultType, Severity,
    };
    use crate::rules::{Clause, Condition, Operation};
    use chrono::Utc;

    fn rule(name: &str, severity: Severity, result_type: ResultType, field: &str, prefix: &str) -> Rule {
        Rule {
            name: name.to_string(),
            description: String::new(),
            severity,
            result_type,
            change_types: None,
            platforms: None,
            condition: Condition {
                clauses: vec![Clause {
                    label: None,
                    field: Some(field.to_string()),
                    operation: Operation::StartsWith,
                    data: vec![prefix.to_string()],
                    invert: false,
                }],
                expression: None,
            },
        }
    }

    fn options(parallelism: usize) -> AnalyzerOptions {
        AnalyzerOptions {
            parallelism: Some(parallelism),
            platform: Platform::Linux,
            ..AnalyzerOptions::default()
        }
    }

    fn tmp_file_event(path: &str) -> MonitorEvent {
        MonitorEvent::FileSystem(FileSystemEvent {
            change_type: ChangeType::Created,
            path: path.to_string(),
            old_path: None,
            timestamp: Utc::now(),
            snapshot: Some(CollectObject::new(ResultType::File, path).with_attribute("path", path)),
        })
    }

    #[test]
    fn test_classify_takes_max_of_matches() {
        let rules = RuleSet::new(vec![
            rule("tmp", Severity::Low, ResultType::File, "path", "/tmp"),
            rule("tmp-x", Severity::High, ResultType::File, "path", "/tmp/x"),
            rule("etc", Severity::Critical, ResultType::File, "path", "/etc"),
        ]);
        let classifier = Classifier::new(Arc::new(rules), Arc::new(ClauseEvaluator::new()), Platform::Linux);
        let record = ChangeRecord::created(
            CollectObject::new(ResultType::File, "/tmp/x1").with_attribute("path", "/tmp/x1"),
            None,
            "r",
        );

        let classification = classifier.classify(&record);
        let names: Vec<_> = classification.matched_rules().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["tmp", "tmp-x"]);
        assert_eq!(classification.severity(), Severity::High);
    }

    #[test]
    fn test_unmatched_record_gets_category_default() {
        let rules = RuleSet::new(vec![rule("etc", Severity::High, ResultType::File, "path", "/etc")])
            .with_default_level(ResultType::File, Severity::Low);
        let classifier = Classifier::new(Arc::new(rules), Arc::new(ClauseEvaluator::new()), Platform::Linux);
        let record = ChangeRecord::created(CollectObject::new(ResultType::File, "/home/a"), None, "r");

        let classification = classifier.classify(&record);
        assert!(classification.matched_rules().is_empty());
        assert_eq!(classification.severity(), Severity::Low);
    }

    #[test]
    fn test_sub_object_matches_are_appended() {
        let rules = RuleSet::new(vec![
            rule("monitored", Severity::Low, ResultType::FileMonitor, "path", "/tmp"),
            rule("file", Severity::Critical, ResultType::File, "path", "/tmp"),
        ]);
        let record = ChangeRecord::from_event(tmp_file_event("/tmp/dropper"), "mon");

        let with = Classifier::new(Arc::new(rules.clone()), Arc::new(ClauseEvaluator::new()), Platform::Linux);
        let classification = with.classify(&record);
        assert_eq!(classification.matched_rules().len(), 2);
        assert_eq!(classification.severity(), Severity::Critical);

        let without = Classifier::new(Arc::new(rules), Arc::new(ClauseEvaluator::new()), Platform::Linux)
            .with_sub_object_rules(false);
        let classification = without.classify(&record);
        assert_eq!(classification.matched_rules().len(), 1);
        assert_eq!(classification.severity(), Severity::Low);
    }

    #[test]
    fn test_analyze_classifies_every_record() {
        let rules = RuleSet::new(vec![rule("tmp", Severity::Medium, ResultType::File, "path", "/tmp")]);
        let analyzer = Analyzer::new(rules, RuleSource::Embedded, options(4)).unwrap();
        assert_eq!(analyzer.thread_count(), 4);

        let records = (0..100).map(|i| {
            let path = format!("/tmp/{}", i);
            ChangeRecord::created(CollectObject::new(ResultType::File, &path).with_attribute("path", path.as_str()), None, "r")
        });
        let mut results = ResultSet::from_records(records);

        let status = analyzer.analyze(&mut results);
        assert_eq!(status, AnalysisStatus::Analyzed { records: 100 });
        assert_eq!(results.len(), 100);
        assert!(results.is_fully_classified());
        assert_eq!(results.severity_counts().get(&Severity::Medium), Some(&100));
    }

    #[test]
    fn test_invalid_rules_skip_analysis() {
        let mut broken = rule("broken", Severity::High, ResultType::File, "path", "/");
        broken.condition.clauses.clear();
        let analyzer = Analyzer::new(
            RuleSet::new(vec![broken]),
            RuleSource::File("/etc/driftscan/rules.json".into()),
            options(1),
        )
        .unwrap();

        let mut results = ResultSet::from_records(vec![ChangeRecord::created(
            CollectObject::new(ResultType::File, "/a"),
            None,
            "r",
        )]);
        let status = analyzer.analyze(&mut results);

        assert_eq!(
            status,
            AnalysisStatus::Skipped {
                violations: 1,
                rules_source: "/etc/driftscan/rules.json".to_string()
            }
        );
        assert!(results.iter().all(|r| r.classification.is_none()));
    }

    #[test]
    fn test_monitored_records_keyed_by_event() {
        let events = vec![
            tmp_file_event("/tmp/a"),
            MonitorEvent::Generic(GenericEvent {
                result_type: ResultType::Process,
                change_type: ChangeType::Deleted,
                identity: "7:1".to_string(),
                attributes: Default::default(),
                timestamp: Utc::now(),
            }),
        ];
        let results = Analyzer::monitored_records("mon", events);

        assert_eq!(results.group_count(), 2);
        assert!(results.contains_key(&GroupKey::new(ResultType::FileMonitor, ChangeType::Created)));
        assert!(results.contains_key(&GroupKey::new(ResultType::Process, ChangeType::Deleted)));
        assert!(results.iter().all(|r| r.record.base.is_none()));
    }
}
