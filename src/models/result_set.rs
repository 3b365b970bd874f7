//! Grouped result sets keyed by (ResultType, ChangeType)

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::{ChangeRecord, ChangeType, CompareResult, ResultType, Severity};

/// Group key of a result set. Renders as `FILE_CREATED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub result_type: ResultType,
    pub change_type: ChangeType,
}

impl GroupKey {
    pub fn new(result_type: ResultType, change_type: ChangeType) -> Self {
        Self {
            result_type,
            change_type,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.result_type, self.change_type)
    }
}

impl FromStr for GroupKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Change type names never contain '_', result type names may
        let (result_type, change_type) = s
            .rsplit_once('_')
            .ok_or_else(|| format!("malformed group key '{}'", s))?;
        Ok(GroupKey::new(result_type.parse()?, change_type.parse()?))
    }
}

impl Serialize for GroupKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GroupKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Change records grouped by category and change type.
///
/// List order inside a group is production order and carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultSet {
    groups: BTreeMap<GroupKey, Vec<CompareResult>>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group unclassified records by their own key
    pub fn from_records(records: impl IntoIterator<Item = ChangeRecord>) -> Self {
        let mut set = Self::new();
        for record in records {
            set.push(record.into());
        }
        set
    }

    pub fn push(&mut self, result: CompareResult) {
        self.groups
            .entry(result.record.key())
            .or_default()
            .push(result);
    }

    pub fn get(&self, key: &GroupKey) -> Option<&[CompareResult]> {
        self.groups.get(key).map(Vec::as_slice)
    }

    pub fn contains_key(&self, key: &GroupKey) -> bool {
        self.groups.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.keys()
    }

    pub fn groups(&self) -> impl Iterator<Item = (&GroupKey, &[CompareResult])> {
        self.groups.iter().map(|(key, list)| (key, list.as_slice()))
    }

    pub(crate) fn groups_mut(&mut self) -> &mut BTreeMap<GroupKey, Vec<CompareResult>> {
        &mut self.groups
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompareResult> {
        self.groups.values().flatten()
    }

    /// Number of groups
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Total records across all groups
    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.values().all(Vec::is_empty)
    }

    /// Merge another set into this one. For keys present in both sets this
    /// set's entry wins and `secondary`'s list for that key is discarded.
    pub fn merge_primary(&mut self, secondary: ResultSet) {
        for (key, list) in secondary.groups {
            if let Entry::Vacant(slot) = self.groups.entry(key) {
                slot.insert(list);
            }
        }
    }

    /// Count of classified records per resolved severity
    pub fn severity_counts(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for result in self.iter() {
            if let Some(classification) = &result.classification {
                *counts.entry(classification.severity()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Whether every record in the set carries a classification
    pub fn is_fully_classified(&self) -> bool {
        self.iter().all(|result| result.classification.is_some())
    }
}
