//! Data models module
//!
//! Defines core data structures:
//! - Run: one identified collection or monitoring execution
//! - CollectObject / MonitorEvent: raw items produced by collectors and monitors
//! - ChangeRecord: a unit of drift between a base and a compare state
//! - Classification: matched rules plus the resolved severity
//! - ResultSet: change records grouped by (ResultType, ChangeType)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::rules::Rule;

mod result_set;

pub use result_set::{GroupKey, ResultSet};

/// Inspected configuration surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultType {
    File,
    Port,
    Certificate,
    Registry,
    Service,
    User,
    Firewall,
    Com,
    EventLog,
    Tpm,
    Key,
    Process,
    Driver,
    Wifi,
    FileMonitor,
}

/// Fields every object exposes regardless of category
const COMMON_FIELDS: &[&str] = &["identity", "result_type"];

impl ResultType {
    pub const ALL: [ResultType; 15] = [
        ResultType::File,
        ResultType::Port,
        ResultType::Certificate,
        ResultType::Registry,
        ResultType::Service,
        ResultType::User,
        ResultType::Firewall,
        ResultType::Com,
        ResultType::EventLog,
        ResultType::Tpm,
        ResultType::Key,
        ResultType::Process,
        ResultType::Driver,
        ResultType::Wifi,
        ResultType::FileMonitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::File => "FILE",
            ResultType::Port => "PORT",
            ResultType::Certificate => "CERTIFICATE",
            ResultType::Registry => "REGISTRY",
            ResultType::Service => "SERVICE",
            ResultType::User => "USER",
            ResultType::Firewall => "FIREWALL",
            ResultType::Com => "COM",
            ResultType::EventLog => "EVENT_LOG",
            ResultType::Tpm => "TPM",
            ResultType::Key => "KEY",
            ResultType::Process => "PROCESS",
            ResultType::Driver => "DRIVER",
            ResultType::Wifi => "WIFI",
            ResultType::FileMonitor => "FILE_MONITOR",
        }
    }

    /// Attribute names objects of this category expose to rule conditions
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            ResultType::File => &[
                "path", "size", "permissions", "owner", "is_executable", "is_directory",
                "is_link", "last_modified", "content_hash", "signature",
            ],
            ResultType::Port => &["port", "protocol", "address", "family", "process_name"],
            ResultType::Certificate => &[
                "subject", "issuer", "thumbprint", "serial_number", "not_before", "not_after",
                "store_location",
            ],
            ResultType::Registry => &["key", "value_name", "value", "view"],
            ResultType::Service => &[
                "name", "display_name", "start_type", "state", "account", "binary_path",
            ],
            ResultType::User => &["name", "account_type", "privileged", "disabled", "groups"],
            ResultType::Firewall => &[
                "name", "action", "direction", "protocol", "local_ports", "remote_addresses",
                "application",
            ],
            ResultType::Com => &["clsid", "server_path", "x86_server_path"],
            ResultType::EventLog => &["source", "level", "event_id", "summary", "timestamp"],
            ResultType::Tpm => &["version", "manufacturer", "pcrs", "nv_indices"],
            ResultType::Key => &["name", "algorithm", "key_size", "container"],
            ResultType::Process => &[
                "pid", "name", "exe", "cmd", "start_time", "parent_pid", "user",
            ],
            ResultType::Driver => &["name", "path", "signed", "start_type"],
            ResultType::Wifi => &["ssid", "authentication", "encryption", "password"],
            ResultType::FileMonitor => &["path", "old_path", "change_type", "timestamp"],
        }
    }

    /// Whether `root` names a field objects of this category expose
    pub fn exposes(&self, root: &str) -> bool {
        COMMON_FIELDS.contains(&root) || self.fields().contains(&root)
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResultType::ALL
            .iter()
            .copied()
            .find(|rt| rt.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown result type '{}'", s))
    }
}

/// Kind of drift a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Created,
    Deleted,
    Modified,
    /// File-system rename observed by a monitor
    Renamed,
    /// Raw monitored event with no drift classification of its own
    Observed,
}

impl ChangeType {
    pub const ALL: [ChangeType; 5] = [
        ChangeType::Created,
        ChangeType::Deleted,
        ChangeType::Modified,
        ChangeType::Renamed,
        ChangeType::Observed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "CREATED",
            ChangeType::Deleted => "DELETED",
            ChangeType::Modified => "MODIFIED",
            ChangeType::Renamed => "RENAMED",
            ChangeType::Observed => "OBSERVED",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChangeType::ALL
            .iter()
            .copied()
            .find(|ct| ct.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown change type '{}'", s))
    }
}

/// Operating system a run was taken on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Linux,
    Windows,
    Macos,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => Platform::Windows,
            "macos" => Platform::Macos,
            _ => Platform::Linux,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Linux => "LINUX",
            Platform::Windows => "WINDOWS",
            Platform::Macos => "MACOS",
        };
        f.write_str(name)
    }
}

/// Ordered risk level assigned by rule matching or category default
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Information,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::None => "none",
            Severity::Information => "information",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Collect,
    Monitor,
}

/// Metadata for one collection or monitoring phase. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub platform: Platform,
    pub result_types: BTreeSet<ResultType>,
    pub run_type: RunType,
}

impl Run {
    pub fn new(run_id: impl Into<String>, run_type: RunType, result_types: BTreeSet<ResultType>) -> Self {
        Self {
            run_id: run_id.into(),
            timestamp: Utc::now(),
            version: crate::VERSION.to_string(),
            platform: Platform::current(),
            result_types,
            run_type,
        }
    }
}

/// Generate a sortable run identifier from the current UTC time
pub fn generate_run_id() -> String {
    use time::format_description::well_known::Iso8601;
    use time::OffsetDateTime;

    let now = OffsetDateTime::now_utc();
    now.format(&Iso8601::DEFAULT)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Raw snapshot object emitted by a collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectObject {
    pub result_type: ResultType,
    /// Unique per (run, result_type)
    pub identity: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl CollectObject {
    pub fn new(result_type: ResultType, identity: impl Into<String>) -> Self {
        Self {
            result_type,
            identity: identity.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Resolve a dotted field path against this object
    pub fn field(&self, path: &str) -> Option<Value> {
        let (root, rest) = split_path(path);
        let value = match root {
            "identity" => Value::String(self.identity.clone()),
            "result_type" => Value::String(self.result_type.to_string()),
            _ => self.attributes.get(root)?.clone(),
        };
        descend(value, rest)
    }
}

/// Event observed by a monitor while it runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorEvent {
    Generic(GenericEvent),
    FileSystem(FileSystemEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericEvent {
    pub result_type: ResultType,
    pub change_type: ChangeType,
    pub identity: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSystemEvent {
    pub change_type: ChangeType,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// File snapshot taken when the event was observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<CollectObject>,
}

impl MonitorEvent {
    pub fn result_type(&self) -> ResultType {
        match self {
            MonitorEvent::Generic(event) => event.result_type,
            MonitorEvent::FileSystem(_) => ResultType::FileMonitor,
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self {
            MonitorEvent::Generic(event) => event.change_type,
            MonitorEvent::FileSystem(event) => event.change_type,
        }
    }

    pub fn identity(&self) -> &str {
        match self {
            MonitorEvent::Generic(event) => &event.identity,
            MonitorEvent::FileSystem(event) => &event.path,
        }
    }

    /// Inner payload that sub-object rules are applied to
    pub fn sub_object(&self) -> Option<&CollectObject> {
        match self {
            MonitorEvent::Generic(_) => None,
            MonitorEvent::FileSystem(event) => event.snapshot.as_ref(),
        }
    }

    pub fn field(&self, path: &str) -> Option<Value> {
        let (root, rest) = split_path(path);
        let value = match (self, root) {
            (_, "identity") => Value::String(self.identity().to_string()),
            (_, "result_type") => Value::String(self.result_type().to_string()),
            (MonitorEvent::Generic(event), name) => event.attributes.get(name)?.clone(),
            (MonitorEvent::FileSystem(event), "path") => Value::String(event.path.clone()),
            (MonitorEvent::FileSystem(event), "old_path") => {
                Value::String(event.old_path.clone()?)
            }
            (MonitorEvent::FileSystem(event), "change_type") => {
                Value::String(event.change_type.to_string())
            }
            (MonitorEvent::FileSystem(event), "timestamp") => {
                Value::String(event.timestamp.to_rfc3339())
            }
            (MonitorEvent::FileSystem(_), _) => return None,
        };
        descend(value, rest)
    }
}

/// Either side of a change record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Object(CollectObject),
    Event(MonitorEvent),
}

impl Payload {
    pub fn identity(&self) -> &str {
        match self {
            Payload::Object(object) => &object.identity,
            Payload::Event(event) => event.identity(),
        }
    }

    pub fn field(&self, path: &str) -> Option<Value> {
        match self {
            Payload::Object(object) => object.field(path),
            Payload::Event(event) => event.field(path),
        }
    }
}

/// A unit of detected drift, or a single monitored event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub result_type: ResultType,
    pub change_type: ChangeType,
    /// Absent for Created records and monitored events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Payload>,
    /// Absent for Deleted records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_run_id: Option<String>,
    pub compare_run_id: String,
}

impl ChangeRecord {
    pub fn created(object: CollectObject, base_run_id: Option<&str>, compare_run_id: &str) -> Self {
        Self {
            result_type: object.result_type,
            change_type: ChangeType::Created,
            base: None,
            compare: Some(Payload::Object(object)),
            base_run_id: base_run_id.map(str::to_string),
            compare_run_id: compare_run_id.to_string(),
        }
    }

    pub fn deleted(object: CollectObject, base_run_id: &str, compare_run_id: &str) -> Self {
        Self {
            result_type: object.result_type,
            change_type: ChangeType::Deleted,
            base: Some(Payload::Object(object)),
            compare: None,
            base_run_id: Some(base_run_id.to_string()),
            compare_run_id: compare_run_id.to_string(),
        }
    }

    pub fn modified(
        base: CollectObject,
        compare: CollectObject,
        base_run_id: &str,
        compare_run_id: &str,
    ) -> Self {
        Self {
            result_type: compare.result_type,
            change_type: ChangeType::Modified,
            base: Some(Payload::Object(base)),
            compare: Some(Payload::Object(compare)),
            base_run_id: Some(base_run_id.to_string()),
            compare_run_id: compare_run_id.to_string(),
        }
    }

    /// Monitored events have no base state
    pub fn from_event(event: MonitorEvent, run_id: &str) -> Self {
        Self {
            result_type: event.result_type(),
            change_type: event.change_type(),
            base: None,
            compare: Some(Payload::Event(event)),
            base_run_id: None,
            compare_run_id: run_id.to_string(),
        }
    }

    pub fn identity(&self) -> &str {
        self.compare
            .as_ref()
            .or(self.base.as_ref())
            .map(Payload::identity)
            .unwrap_or_default()
    }

    pub fn key(&self) -> GroupKey {
        GroupKey::new(self.result_type, self.change_type)
    }

    /// The inner payload of a monitored event, as an independent record
    pub fn sub_object_record(&self) -> Option<ChangeRecord> {
        let Some(Payload::Event(event)) = &self.compare else {
            return None;
        };
        let inner = event.sub_object()?;
        Some(ChangeRecord {
            result_type: inner.result_type,
            change_type: self.change_type,
            base: None,
            compare: Some(Payload::Object(inner.clone())),
            base_run_id: None,
            compare_run_id: self.compare_run_id.clone(),
        })
    }
}

/// Rules matched by a record and the severity they resolve to.
///
/// Always built through [`Classification::resolve`], deserialization
/// included, so the severity is the maximum matched flag, or the category
/// default when nothing matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredClassification")]
pub struct Classification {
    matched_rules: Vec<Arc<Rule>>,
    severity: Severity,
}

/// Serialized form; a stored severity only stands in as the default level
#[derive(Deserialize)]
struct StoredClassification {
    #[serde(default)]
    matched_rules: Vec<Arc<Rule>>,
    severity: Severity,
}

impl From<StoredClassification> for Classification {
    fn from(stored: StoredClassification) -> Self {
        Classification::resolve(stored.matched_rules, stored.severity)
    }
}

impl Classification {
    pub fn resolve(matched_rules: Vec<Arc<Rule>>, default_level: Severity) -> Self {
        let severity = matched_rules
            .iter()
            .map(|rule| rule.severity)
            .max()
            .unwrap_or(default_level);
        Self {
            matched_rules,
            severity,
        }
    }

    /// Append further matches and re-resolve the severity
    pub fn extend(self, more: Vec<Arc<Rule>>, default_level: Severity) -> Self {
        let mut matched_rules = self.matched_rules;
        matched_rules.extend(more);
        Self::resolve(matched_rules, default_level)
    }

    pub fn matched_rules(&self) -> &[Arc<Rule>] {
        &self.matched_rules
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }
}

/// A change record, classified once analysis has run over it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareResult {
    pub record: ChangeRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
}

impl From<ChangeRecord> for CompareResult {
    fn from(record: ChangeRecord) -> Self {
        Self {
            record,
            classification: None,
        }
    }
}

fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((root, rest)) => (root, Some(rest)),
        None => (path, None),
    }
}

/// Walk the remaining dotted segments into nested objects and arrays
fn descend(value: Value, rest: Option<&str>) -> Option<Value> {
    let Some(rest) = rest else {
        return Some(value);
    };
    let mut current = value;
    for segment in rest.split('.') {
        current = match current {
            Value::Object(mut map) => map.remove(segment)?,
            Value::Array(mut items) => {
                let index: usize = segment.parse().ok()?;
                if index >= items.len() {
                    return None;
                }
                items.swap_remove(index)
            }
            _ => return None,
        };
    }
    Some(current)
}
