use std::collections::BTreeMap;

/// Difference between two consecutive snapshots
#[derive(Debug, Clone, PartialEq)]
pub enum Change<V> {
    Created(V),
    Deleted(V),
    Modified { before: V, after: V },
}

/// Manages snapshot state between polling cycles
pub struct SnapshotTracker<V> {
    current_snapshot: Option<BTreeMap<String, V>>,
}

impl<V> Default for SnapshotTracker<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SnapshotTracker<V> {
    pub fn new() -> Self {
        Self {
            current_snapshot: None,
        }
    }

    pub fn is_primed(&self) -> bool {
        self.current_snapshot.is_some()
    }
}

impl<V: Clone + PartialEq> SnapshotTracker<V> {
    /// Compare `new_snapshot` with the previous one and keep it for the next
    /// cycle. The first snapshot is a baseline and reports nothing.
    pub fn detect_changes(&mut self, new_snapshot: BTreeMap<String, V>) -> Vec<Change<V>> {
        let changes = match &self.current_snapshot {
            None => Vec::new(),
            Some(previous) => diff(previous, &new_snapshot),
        };

        self.current_snapshot = Some(new_snapshot);
        changes
    }
}

fn diff<V: Clone + PartialEq>(previous: &BTreeMap<String, V>, current: &BTreeMap<String, V>) -> Vec<Change<V>> {
    let mut changes = Vec::new();

    for (key, value) in current {
        match previous.get(key) {
            None => changes.push(Change::Created(value.clone())),
            Some(before) if before != value => changes.push(Change::Modified {
                before: before.clone(),
                after: value.clone(),
            }),
            Some(_) => {}
        }
    }
    for (key, value) in previous {
        if !current.contains_key(key) {
            changes.push(Change::Deleted(value.clone()));
        }
    }

    changes
}
