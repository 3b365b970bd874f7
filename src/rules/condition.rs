//! Rule conditions and the reference clause evaluator
//!
//! A condition is a list of clauses, each testing one field of a record's
//! base or compare payload. Without an expression every clause must hold;
//! with one, clause labels are combined with AND / OR / NOT.

use glob::Pattern;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::expression::Expr;
use crate::models::{ChangeRecord, Payload};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Dotted path into the payload, e.g. `permissions` or `pcrs.sha256.0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<String>,
    #[serde(default)]
    pub invert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    Glob,
    IsNull,
    IsTrue,
    GreaterThan,
    LessThan,
    WasModified,
}

impl Operation {
    /// (minimum, maximum) number of data entries the operation takes
    pub fn data_arity(&self) -> (usize, Option<usize>) {
        match self {
            Operation::Equals
            | Operation::Contains
            | Operation::StartsWith
            | Operation::EndsWith
            | Operation::Regex
            | Operation::Glob => (1, None),
            Operation::GreaterThan | Operation::LessThan => (1, Some(1)),
            Operation::IsNull | Operation::IsTrue | Operation::WasModified => (0, Some(0)),
        }
    }

    pub fn requires_field(&self) -> bool {
        !matches!(self, Operation::WasModified)
    }
}

/// Decides whether a condition holds for a change record
pub trait ConditionEvaluator: Send + Sync {
    fn matches(&self, condition: &Condition, record: &ChangeRecord) -> bool;
}

/// Reference evaluator for the clause language. Compiled regexes, globs and
/// parsed expressions are cached across calls.
#[derive(Debug, Default)]
pub struct ClauseEvaluator {
    regexes: RwLock<HashMap<String, Option<Arc<Regex>>>>,
    globs: RwLock<HashMap<String, Option<Arc<Pattern>>>>,
    expressions: RwLock<HashMap<String, Option<Arc<Expr>>>>,
}

impl ClauseEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn clause_holds(&self, clause: &Clause, record: &ChangeRecord) -> bool {
        let holds = match clause.operation {
            Operation::WasModified => match (&record.base, &record.compare) {
                (Some(base), Some(compare)) => match clause.field.as_deref() {
                    Some(field) => base.field(field) != compare.field(field),
                    None => base != compare,
                },
                _ => false,
            },
            _ => [record.base.as_ref(), record.compare.as_ref()]
                .into_iter()
                .flatten()
                .any(|payload| self.payload_holds(clause, payload)),
        };
        holds != clause.invert
    }

    fn payload_holds(&self, clause: &Clause, payload: &Payload) -> bool {
        let value = clause.field.as_deref().and_then(|field| payload.field(field));

        match clause.operation {
            Operation::IsNull => value.map_or(true, |v| v.is_null()),
            Operation::IsTrue => matches!(value, Some(Value::Bool(true))),
            Operation::WasModified => false,
            _ => {
                let Some(value) = value else {
                    return false;
                };
                match clause.operation {
                    Operation::Equals => texts(&value).iter().any(|t| clause.data.contains(t)),
                    Operation::Contains => match &value {
                        Value::String(s) => clause.data.iter().any(|d| s.contains(d.as_str())),
                        _ => texts(&value).iter().any(|t| clause.data.contains(t)),
                    },
                    Operation::StartsWith => texts(&value)
                        .iter()
                        .any(|t| clause.data.iter().any(|d| t.starts_with(d.as_str()))),
                    Operation::EndsWith => texts(&value)
                        .iter()
                        .any(|t| clause.data.iter().any(|d| t.ends_with(d.as_str()))),
                    Operation::Regex => texts(&value).iter().any(|t| {
                        clause
                            .data
                            .iter()
                            .filter_map(|d| self.regex(d))
                            .any(|re| re.is_match(t))
                    }),
                    Operation::Glob => texts(&value).iter().any(|t| {
                        clause
                            .data
                            .iter()
                            .filter_map(|d| self.glob(d))
                            .any(|pattern| pattern.matches(t))
                    }),
                    Operation::GreaterThan => compare_numbers(&value, &clause.data, |a, b| a > b),
                    Operation::LessThan => compare_numbers(&value, &clause.data, |a, b| a < b),
                    Operation::IsNull | Operation::IsTrue | Operation::WasModified => false,
                }
            }
        }
    }

    fn regex(&self, pattern: &str) -> Option<Arc<Regex>> {
        cached(&self.regexes, pattern, |p| Regex::new(p).ok())
    }

    fn glob(&self, pattern: &str) -> Option<Arc<Pattern>> {
        cached(&self.globs, pattern, |p| Pattern::new(p).ok())
    }

    fn expression(&self, source: &str) -> Option<Arc<Expr>> {
        cached(&self.expressions, source, |s| Expr::parse(s).ok())
    }
}

impl ConditionEvaluator for ClauseEvaluator {
    fn matches(&self, condition: &Condition, record: &ChangeRecord) -> bool {
        if condition.clauses.is_empty() {
            return false;
        }

        match condition.expression.as_deref() {
            None => condition
                .clauses
                .iter()
                .all(|clause| self.clause_holds(clause, record)),
            Some(source) => {
                let Some(expr) = self.expression(source) else {
                    return false;
                };
                expr.evaluate(&|label| {
                    condition
                        .clauses
                        .iter()
                        .find(|clause| clause.label.as_deref() == Some(label))
                        .is_some_and(|clause| self.clause_holds(clause, record))
                })
            }
        }
    }
}

fn cached<T>(
    cache: &RwLock<HashMap<String, Option<Arc<T>>>>,
    key: &str,
    build: impl FnOnce(&str) -> Option<T>,
) -> Option<Arc<T>> {
    if let Ok(map) = cache.read() {
        if let Some(entry) = map.get(key) {
            return entry.clone();
        }
    }
    let built = build(key).map(Arc::new);
    if let Ok(mut map) = cache.write() {
        map.insert(key.to_string(), built.clone());
    }
    built
}

/// Text forms of a value; arrays contribute one entry per element
fn texts(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(text).collect(),
        other => vec![text(other)],
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare_numbers(value: &Value, data: &[String], op: impl Fn(i64, i64) -> bool) -> bool {
    let actual = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    let expected = data.first().and_then(|d| d.trim().parse().ok());
    match (actual, expected) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeType, CollectObject, ResultType};

    fn clause(field: &str, operation: Operation, data: &[&str]) -> Clause {
        Clause {
            label: None,
            field: Some(field.to_string()),
            operation,
            data: data.iter().map(|d| d.to_string()).collect(),
            invert: false,
        }
    }

    fn labeled(label: &str, mut clause: Clause) -> Clause {
        clause.label = Some(label.to_string());
        clause
    }

    fn file(path: &str, permissions: &str, size: u64) -> CollectObject {
        CollectObject::new(ResultType::File, path)
            .with_attribute("path", path)
            .with_attribute("permissions", permissions)
            .with_attribute("size", size)
            .with_attribute("is_executable", true)
    }

    fn check(condition: Condition, record: &ChangeRecord) -> bool {
        ClauseEvaluator::new().matches(&condition, record)
    }

    fn all_of(clauses: Vec<Clause>) -> Condition {
        Condition {
            clauses,
            expression: None,
        }
    }

    #[test]
    fn test_string_operations() {
        let record = ChangeRecord::created(file("/usr/bin/tool", "755", 10), None, "r");

        assert!(check(all_of(vec![clause("path", Operation::Equals, &["/usr/bin/tool"])]), &record));
        assert!(check(all_of(vec![clause("path", Operation::Contains, &["bin"])]), &record));
        assert!(check(all_of(vec![clause("path", Operation::StartsWith, &["/opt", "/usr"])]), &record));
        assert!(check(all_of(vec![clause("path", Operation::EndsWith, &["tool"])]), &record));
        assert!(!check(all_of(vec![clause("path", Operation::EndsWith, &["x"])]), &record));
        assert!(check(all_of(vec![clause("permissions", Operation::Regex, &["^7[0-7]5$"])]), &record));
        assert!(check(all_of(vec![clause("path", Operation::Glob, &["/usr/*/tool"])]), &record));
    }

    #[test]
    fn test_boolean_and_null_operations() {
        let record = ChangeRecord::created(file("/a", "644", 1), None, "r");
        assert!(check(all_of(vec![clause("is_executable", Operation::IsTrue, &[])]), &record));
        assert!(check(all_of(vec![clause("owner", Operation::IsNull, &[])]), &record));

        let mut not_null = clause("path", Operation::IsNull, &[]);
        not_null.invert = true;
        assert!(check(all_of(vec![not_null]), &record));
    }

    #[test]
    fn test_numeric_comparisons() {
        let record = ChangeRecord::created(file("/a", "644", 2048), None, "r");
        assert!(check(all_of(vec![clause("size", Operation::GreaterThan, &["1024"])]), &record));
        assert!(!check(all_of(vec![clause("size", Operation::LessThan, &["1024"])]), &record));
        assert!(!check(all_of(vec![clause("size", Operation::LessThan, &["abc"])]), &record));
    }

    #[test]
    fn test_was_modified_needs_both_sides() {
        let before = file("/a", "644", 1);
        let after = file("/a", "666", 1);
        let modified = ChangeRecord::modified(before.clone(), after, "base", "compare");

        let perms = Clause {
            label: None,
            field: Some("permissions".to_string()),
            operation: Operation::WasModified,
            data: Vec::new(),
            invert: false,
        };
        assert!(check(all_of(vec![perms.clone()]), &modified));

        let mut size = perms.clone();
        size.field = Some("size".to_string());
        assert!(!check(all_of(vec![size]), &modified));

        let created = ChangeRecord::created(before, None, "compare");
        assert!(!check(all_of(vec![perms]), &created));
    }

    #[test]
    fn test_clause_holds_on_either_side() {
        let before = file("/etc/passwd", "644", 1);
        let deleted = ChangeRecord::deleted(before, "base", "compare");
        assert!(check(all_of(vec![clause("path", Operation::StartsWith, &["/etc/"])]), &deleted));
    }

    #[test]
    fn test_expression_combines_labels() {
        let record = ChangeRecord::created(file("/tmp/x", "777", 1), None, "r");
        let condition = Condition {
            clauses: vec![
                labeled("TMP", clause("path", Operation::StartsWith, &["/tmp/"])),
                labeled("SAFE", clause("permissions", Operation::Equals, &["644"])),
            ],
            expression: Some("TMP AND NOT SAFE".to_string()),
        };
        assert!(check(condition.clone(), &record));

        let mut or_condition = condition;
        or_condition.expression = Some("SAFE OR (NOT TMP)".to_string());
        assert!(!check(or_condition, &record));
    }

    #[test]
    fn test_empty_condition_never_matches() {
        let record = ChangeRecord::created(file("/a", "644", 1), None, "r");
        assert!(!check(Condition::default(), &record));
    }

    #[test]
    fn test_array_values_match_any_element() {
        let object = CollectObject::new(ResultType::User, "alice")
            .with_attribute("groups", serde_json::json!(["users", "wheel"]));
        let record = ChangeRecord {
            result_type: ResultType::User,
            change_type: ChangeType::Created,
            base: None,
            compare: Some(Payload::Object(object)),
            base_run_id: None,
            compare_run_id: "r".to_string(),
        };
        assert!(check(all_of(vec![clause("groups", Operation::Contains, &["wheel"])]), &record));
        assert!(!check(all_of(vec![clause("groups", Operation::Equals, &["admin"])]), &record));
    }
}
