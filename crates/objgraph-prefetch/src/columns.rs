//! Per-node column plans.
//!
//! A plan lists, for one entity segment of a flat row, which label holds each
//! column the entity's snapshot needs, and where the primary-key columns sit
//! in that list.

use objgraph_core::{EntityDescriptor, IdentityKey, Row, RowSnapshot, Value, snapshot_from_row};

/// One column of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSource {
    /// Column name on the node's entity.
    pub column: String,
    /// Flat-row label the value is read from.
    pub label: String,
    /// Value is supplied by an ancestor's segment.
    pub inherited: bool,
}

/// Column plan for one prefetch node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeColumns {
    entries: Vec<ColumnSource>,
    pk_index: Vec<usize>,
}

impl NodeColumns {
    /// Plan for rows labelled with plain column names (single-entity queries).
    pub fn for_root(entity: &EntityDescriptor) -> Self {
        Self::plan(entity, &[], std::iter::empty())
    }

    /// Compose a plan.
    ///
    /// Order: columns inherited from the parent's join, then mapped attributes,
    /// then relationship join columns, then any primary-key column not yet
    /// covered. Labels are `prefix.COLUMN`, or the bare column at the root.
    pub fn plan<'a>(
        entity: &EntityDescriptor,
        prefix: &[String],
        inherited: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut plan = Self::default();
        let label_for = |column: &str| {
            if prefix.is_empty() {
                column.to_string()
            } else {
                format!("{}.{}", prefix.join("."), column)
            }
        };

        for (column, label) in inherited {
            if !entity.is_primary_key(column) {
                plan.push(column, label.to_string(), true);
            }
        }
        for attribute in &entity.attributes {
            plan.push(&attribute.column, label_for(&attribute.column), false);
        }
        for relationship in &entity.relationships {
            if let Some(hop) = relationship.first_hop() {
                for column in hop.source_columns() {
                    plan.push(column, label_for(column), false);
                }
            }
        }
        for column in entity.primary_key() {
            plan.push(column, label_for(column), false);
        }

        plan.pk_index = entity
            .primary_key()
            .iter()
            .filter_map(|pk| plan.entries.iter().position(|e| &e.column == pk))
            .collect();
        plan
    }

    fn push(&mut self, column: &str, label: String, inherited: bool) {
        if self.entries.iter().any(|e| e.column == column) {
            return;
        }
        self.entries.push(ColumnSource {
            column: column.to_string(),
            label,
            inherited,
        });
    }

    /// All planned columns.
    pub fn entries(&self) -> &[ColumnSource] {
        &self.entries
    }

    /// Positions of the primary-key columns within [`NodeColumns::entries`].
    pub fn pk_index(&self) -> &[usize] {
        &self.pk_index
    }

    /// Flat-row label holding the given target column, if planned.
    pub fn source_for_target(&self, column: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.column == column)
            .map(|e| e.label.as_str())
    }

    /// Compute the identity key from the primary-key slice of a row.
    ///
    /// Returns `None` when any key column is NULL or missing, which is how an
    /// outer join reports "no related row".
    pub fn identity_key(&self, entity: &str, row: &Row) -> Option<IdentityKey> {
        let mut values: Vec<(&str, Value)> = Vec::with_capacity(self.pk_index.len());
        for &index in &self.pk_index {
            let entry = &self.entries[index];
            match row.get_by_name(&entry.label) {
                Some(value) if !value.is_null() => values.push((&entry.column, value.clone())),
                _ => return None,
            }
        }
        if values.is_empty() {
            return None;
        }
        Some(IdentityKey::new(entity, values))
    }

    /// Extract this node's snapshot from a row.
    pub fn snapshot(&self, row: &Row) -> RowSnapshot {
        snapshot_from_row(
            row,
            self.entries
                .iter()
                .map(|e| (e.label.as_str(), e.column.as_str())),
        )
    }
}
