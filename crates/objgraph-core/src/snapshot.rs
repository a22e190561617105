//! Row snapshots and the snapshot difference rule.

use crate::error::{Error, Result};
use crate::row::Row;
use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered mapping from column name to scalar value for one entity row.
///
/// Used both as the committed state of an object (owned by the snapshot
/// cache) and as the current state derived from a live object. On the wire it
/// is a plain JSON object in column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowSnapshot {
    values: IndexMap<String, Value>,
}

impl RowSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by column name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Get a value, treating an absent column as NULL.
    pub fn get_or_null(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&Value::Null)
    }

    /// Set a column value, returning the previous one.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(column.into(), value.into())
    }

    /// Remove a column, preserving the order of the remaining ones.
    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.values.shift_remove(column)
    }

    /// Check if the snapshot carries a column.
    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over (column, value) pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate over column names in order.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Encode in the transmitted shape: a JSON object in column order.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Custom(format!("failed to encode snapshot: {e}")))
    }

    /// Decode a snapshot received from a peer.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Custom(format!("failed to decode snapshot: {e}")))
    }

    /// Merge a partial change (as produced by [`diff_snapshots`]) into this snapshot.
    pub fn apply_diff(&mut self, diff: &RowSnapshot) {
        for (column, value) in diff.iter() {
            self.values.insert(column.to_string(), value.clone());
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for RowSnapshot {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Extract the columns relevant to one entity from a (possibly wider) flat row.
///
/// `column_to_attribute` maps a row label to the column name the snapshot
/// should carry it under. Labels missing from the row are skipped.
pub fn snapshot_from_row<'a, I>(row: &Row, column_to_attribute: I) -> RowSnapshot
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut snapshot = RowSnapshot::new();
    for (label, column) in column_to_attribute {
        if let Some(value) = row.get_by_name(label) {
            snapshot.insert(column, value.clone());
        }
    }
    snapshot
}

/// Compute the minimal set of changed columns between two snapshots.
///
/// A column is included when exactly one side is NULL, or when both are
/// non-NULL and unequal. A column absent from `current` counts as NULL there,
/// so a committed non-NULL value missing from the current state is emitted as
/// an explicit NULL. Returns `None` when nothing changed.
pub fn diff_snapshots(committed: &RowSnapshot, current: &RowSnapshot) -> Option<RowSnapshot> {
    let mut changes = RowSnapshot::new();

    for (column, new_value) in current.iter() {
        let old_value = committed.get_or_null(column);
        if values_differ(old_value, new_value) {
            changes.insert(column, new_value.clone());
        }
    }

    for (column, old_value) in committed.iter() {
        if !current.contains(column) && !old_value.is_null() {
            changes.insert(column, Value::Null);
        }
    }

    if changes.is_empty() { None } else { Some(changes) }
}

fn values_differ(old: &Value, new: &Value) -> bool {
    match (old.is_null(), new.is_null()) {
        (true, true) => false,
        (false, false) => !old.same_as(new),
        _ => true,
    }
}
