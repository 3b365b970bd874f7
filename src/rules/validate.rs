//! Structural rule validation
//!
//! Validation never fails or panics: every problem found is returned as a
//! [`Violation`] and the caller decides what to do with the count.

use glob::Pattern;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;

use super::condition::{Clause, Operation};
use super::expression::Expr;
use super::{Rule, RuleSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: String,
    /// Index of the offending clause, when the problem is clause-local
    pub clause: Option<usize>,
    pub description: String,
}

impl Violation {
    fn rule(rule: &Rule, description: impl Into<String>) -> Self {
        Self {
            rule: rule.name.clone(),
            clause: None,
            description: description.into(),
        }
    }

    fn clause(rule: &Rule, index: usize, description: impl Into<String>) -> Self {
        Self {
            rule: rule.name.clone(),
            clause: Some(index),
            description: description.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.rule.trim().is_empty() { "<unnamed>" } else { &self.rule };
        match self.clause {
            Some(index) => write!(f, "rule '{}' clause {}: {}", name, index, self.description),
            None => write!(f, "rule '{}': {}", name, self.description),
        }
    }
}

pub fn validate_rule_set(rules: &RuleSet) -> Vec<Violation> {
    rules
        .rules()
        .iter()
        .flat_map(|rule| validate_rule(rule))
        .collect()
}

pub fn validate_rule(rule: &Rule) -> Vec<Violation> {
    let mut violations = Vec::new();

    if rule.name.trim().is_empty() {
        violations.push(Violation::rule(rule, "rule name is empty"));
    }

    let clauses = &rule.condition.clauses;
    if clauses.is_empty() {
        violations.push(Violation::rule(rule, "condition has no clauses"));
    }

    for (index, clause) in clauses.iter().enumerate() {
        validate_clause(rule, index, clause, &mut violations);
    }

    if let Some(source) = rule.condition.expression.as_deref() {
        validate_expression(rule, source, &mut violations);
    }

    violations
}

fn validate_clause(rule: &Rule, index: usize, clause: &Clause, violations: &mut Vec<Violation>) {
    match clause.field.as_deref() {
        None if clause.operation.requires_field() => {
            violations.push(Violation::clause(rule, index, "clause has no field"));
        }
        Some(field) => {
            let root = field.split('.').next().unwrap_or_default();
            if !rule.result_type.exposes(root) {
                violations.push(Violation::clause(
                    rule,
                    index,
                    format!("field '{}' is not exposed by {}", root, rule.result_type),
                ));
            }
        }
        None => {}
    }

    let (min, max) = clause.operation.data_arity();
    let count = clause.data.len();
    if count < min || max.is_some_and(|max| count > max) {
        let expected = match max {
            Some(max) if max == min => format!("{}", min),
            Some(max) => format!("{}..={}", min, max),
            None => format!("at least {}", min),
        };
        violations.push(Violation::clause(
            rule,
            index,
            format!("{:?} takes {} data entries, found {}", clause.operation, expected, count),
        ));
    }

    match clause.operation {
        Operation::GreaterThan | Operation::LessThan => {
            for datum in &clause.data {
                if datum.trim().parse::<i64>().is_err() {
                    violations.push(Violation::clause(
                        rule,
                        index,
                        format!("'{}' is not an integer", datum),
                    ));
                }
            }
        }
        Operation::Regex => {
            for datum in &clause.data {
                if let Err(e) = Regex::new(datum) {
                    violations.push(Violation::clause(rule, index, format!("invalid regex: {}", e)));
                }
            }
        }
        Operation::Glob => {
            for datum in &clause.data {
                if let Err(e) = Pattern::new(datum) {
                    violations.push(Violation::clause(rule, index, format!("invalid glob: {}", e)));
                }
            }
        }
        _ => {}
    }
}

fn validate_expression(rule: &Rule, source: &str, violations: &mut Vec<Violation>) {
    let clauses = &rule.condition.clauses;

    let mut defined = BTreeSet::new();
    for (index, clause) in clauses.iter().enumerate() {
        match clause.label.as_deref() {
            Some(label) => {
                if !defined.insert(label) {
                    violations.push(Violation::clause(
                        rule,
                        index,
                        format!("duplicate label '{}'", label),
                    ));
                }
            }
            None => violations.push(Violation::clause(
                rule,
                index,
                "clause has no label but the condition uses an expression",
            )),
        }
    }

    let expr = match Expr::parse(source) {
        Ok(expr) => expr,
        Err(e) => {
            violations.push(Violation::rule(rule, format!("expression '{}': {}", source, e)));
            return;
        }
    };

    let referenced = expr.labels();
    for label in referenced.difference(&defined) {
        violations.push(Violation::rule(rule, format!("expression references undefined label '{}'", label)));
    }
    for (index, clause) in clauses.iter().enumerate() {
        if let Some(label) = clause.label.as_deref() {
            if !referenced.contains(label) {
                violations.push(Violation::clause(
                    rule,
                    index,
                    format!("label '{}' is not used by the expression", label),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResultType, Severity};
    use crate::rules::Condition;

    fn clause(label: Option<&str>, field: Option<&str>, operation: Operation, data: &[&str]) -> Clause {
        Clause {
            label: label.map(str::to_string),
            field: field.map(str::to_string),
            operation,
            data: data.iter().map(|d| d.to_string()).collect(),
            invert: false,
        }
    }

    fn rule(clauses: Vec<Clause>, expression: Option<&str>) -> Rule {
        Rule {
            name: "test rule".to_string(),
            description: String::new(),
            severity: Severity::Medium,
            result_type: ResultType::File,
            change_types: None,
            platforms: None,
            condition: Condition {
                clauses,
                expression: expression.map(str::to_string),
            },
        }
    }

    #[test]
    fn test_valid_rule_has_no_violations() {
        let r = rule(
            vec![
                clause(Some("A"), Some("path"), Operation::StartsWith, &["/tmp"]),
                clause(Some("B"), Some("size"), Operation::GreaterThan, &["10"]),
                clause(Some("C"), Some("permissions"), Operation::WasModified, &[]),
            ],
            Some("A AND (B OR NOT C)"),
        );
        assert!(validate_rule(&r).is_empty(), "{:?}", validate_rule(&r));
    }

    #[test]
    fn test_empty_name_and_no_clauses() {
        let mut r = rule(Vec::new(), None);
        r.name = "  ".to_string();
        let violations = validate_rule(&r);
        assert_eq!(violations.len(), 2);
        assert!(violations[0].to_string().contains("<unnamed>"));
    }

    #[test]
    fn test_field_checks() {
        let r = rule(
            vec![
                clause(None, None, Operation::Equals, &["x"]),
                clause(None, Some("port"), Operation::Equals, &["22"]),
                clause(None, None, Operation::WasModified, &[]),
            ],
            None,
        );
        let violations = validate_rule(&r);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].clause, Some(0));
        assert_eq!(violations[1].clause, Some(1));
        assert!(violations[1].description.contains("not exposed"));
    }

    #[test]
    fn test_data_checks() {
        let r = rule(
            vec![
                clause(None, Some("path"), Operation::Equals, &[]),
                clause(None, Some("size"), Operation::LessThan, &["big"]),
                clause(None, Some("size"), Operation::GreaterThan, &["1", "2"]),
                clause(None, Some("is_link"), Operation::IsTrue, &["yes"]),
                clause(None, Some("path"), Operation::Regex, &["(unclosed"]),
                clause(None, Some("path"), Operation::Glob, &["[z-a"]),
            ],
            None,
        );
        let violations = validate_rule(&r);
        let flagged: Vec<_> = violations.iter().filter_map(|v| v.clause).collect();
        assert_eq!(flagged, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_expression_checks() {
        let r = rule(
            vec![
                clause(Some("A"), Some("path"), Operation::IsNull, &[]),
                clause(Some("A"), Some("size"), Operation::IsNull, &[]),
                clause(None, Some("owner"), Operation::IsNull, &[]),
                clause(Some("UNUSED"), Some("owner"), Operation::IsNull, &[]),
            ],
            Some("A AND MISSING"),
        );
        let violations = validate_rule(&r);
        let descriptions: Vec<_> = violations.iter().map(|v| v.description.as_str()).collect();
        assert_eq!(violations.len(), 4, "{:?}", descriptions);
        assert!(descriptions.iter().any(|d| d.contains("duplicate label 'A'")));
        assert!(descriptions.iter().any(|d| d.contains("has no label")));
        assert!(descriptions.iter().any(|d| d.contains("undefined label 'MISSING'")));
        assert!(descriptions.iter().any(|d| d.contains("'UNUSED' is not used")));
    }

    #[test]
    fn test_unparseable_expression() {
        let r = rule(
            vec![clause(Some("A"), Some("path"), Operation::IsNull, &[])],
            Some("A AND ("),
        );
        let violations = validate_rule(&r);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].description.starts_with("expression"));
    }

    #[test]
    fn test_rule_set_counts_across_rules() {
        let good = rule(vec![clause(None, Some("path"), Operation::IsNull, &[])], None);
        let bad = rule(Vec::new(), None);
        let set = RuleSet::new(vec![good, bad.clone(), bad]);
        assert_eq!(validate_rule_set(&set).len(), 2);
    }
}
