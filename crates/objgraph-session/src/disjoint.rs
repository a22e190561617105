//! Disjoint prefetch: one query per relationship path.
//!
//! Instead of widening the root query with joins, the keys of the parents
//! already in the store are projected into a `KeyIn` qualifier on the target
//! entity. For a relationship flattened through a link table the qualifier
//! columns sit on the first hop's target table, reached from the target
//! through the reversed chain, and come back labelled so each row can be
//! matched to its parents.
//!
//! Fault firing uses the same path with a single parent.

use crate::Session;
use crate::fault::Fault;
use crate::object_store::ObjectId;
use crate::state::ObjectState;
use indexmap::IndexMap;
use objgraph_core::{
    ColumnPath, DbRelationship, EntityDescriptor, IdentityKey, Qualifier, QueryLayer,
    RelationshipDescriptor, Result, Row, RowSnapshot, Schema, Value, with_query_context,
};
use objgraph_prefetch::{NodeColumns, NodeId, PrefetchTree};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, trace};

/// Values of the join columns linking a fetched row to its parents.
#[derive(Debug, Clone)]
pub(crate) struct JoinTuple(Vec<Value>);

impl JoinTuple {
    fn has_null(&self) -> bool {
        self.0.iter().any(Value::is_null)
    }
}

impl PartialEq for JoinTuple {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a.same_as(b))
    }
}

impl Eq for JoinTuple {}

impl Hash for JoinTuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for value in &self.0 {
            value.hash_into(state);
        }
    }
}

/// Columns qualifying the target of `relationship` by its parents' keys.
///
/// One path per join of the first hop, pointing at the first hop's target
/// column as seen from the final target entity.
pub(crate) fn link_columns(
    schema: &Schema,
    relationship: &RelationshipDescriptor,
) -> Result<Vec<ColumnPath>> {
    let Some((first, rest)) = relationship.db_path.split_first() else {
        return Ok(Vec::new());
    };
    let mut back: Vec<String> = Vec::with_capacity(rest.len());
    for hop in rest.iter().rev() {
        back.push(schema.reverse(hop)?.name.clone());
    }
    Ok(first
        .joins
        .iter()
        .map(|join| ColumnPath::through(back.iter().cloned(), join.target.clone()))
        .collect())
}

impl<Q: QueryLayer> Session<Q> {
    /// Resolve one relationship for many parents of the same entity with one query.
    ///
    /// Parents whose slot is already resolved are left alone; NEW parents get
    /// a resolved-empty slot. HOLLOW parents are loaded first when their join
    /// columns are not part of their identity.
    #[tracing::instrument(
        level = "debug",
        skip(self, parents, relationship),
        fields(relationship = %relationship.name, parents = parents.len())
    )]
    pub(crate) fn prefetch_relationship(
        &mut self,
        parents: &[ObjectId],
        relationship: &RelationshipDescriptor,
    ) -> Result<()> {
        let Some(first_hop) = relationship.first_hop().cloned() else {
            return Ok(());
        };
        let to_many = relationship.kind.is_to_many();

        let mut pending: Vec<ObjectId> = Vec::new();
        for &parent in parents {
            let entry = self.store.get(parent)?;
            if entry.fault(&relationship.name).is_some_and(Fault::is_resolved) {
                continue;
            }
            match entry.state() {
                ObjectState::Deleted => {}
                ObjectState::New => {
                    self.store
                        .get_mut(parent)?
                        .set_fault(&relationship.name, Fault::resolved_empty(to_many));
                }
                _ => {
                    if !pending.contains(&parent) {
                        pending.push(parent);
                    }
                }
            }
        }
        if pending.is_empty() {
            trace!("All slots already resolved");
            return Ok(());
        }

        let needs_load: Vec<ObjectId> = pending
            .iter()
            .copied()
            .filter(|id| self.join_tuple(*id, &first_hop).is_none())
            .collect();
        if !needs_load.is_empty() {
            self.load_hollow(&needs_load)?;
        }

        let mut by_tuple: HashMap<JoinTuple, Vec<ObjectId>> = HashMap::new();
        let mut keys: Vec<Vec<Value>> = Vec::new();
        for &parent in &pending {
            let Some(tuple) = self.join_tuple(parent, &first_hop) else {
                continue;
            };
            if tuple.has_null() {
                continue;
            }
            let owners = by_tuple.entry(tuple.clone()).or_default();
            if owners.is_empty() {
                keys.push(tuple.0.clone());
            }
            owners.push(parent);
        }

        let mut rows: Vec<Row> = Vec::new();
        let target = Arc::clone(self.schema.entity(&relationship.target)?);
        let columns = link_columns(&self.schema, relationship)?;
        if !keys.is_empty() {
            let qualifier = Qualifier::KeyIn {
                columns: columns.clone(),
                keys,
            };
            rows = self
                .query
                .execute_query(&target, &qualifier)
                .map_err(|e| {
                    with_query_context(e, &target.name, None, Some(&relationship.db_path_string()))
                })?;
        }

        self.link_fetched(&pending, relationship, &target, &columns, &by_tuple, &rows)
    }

    /// Materialize fetched target rows and attach them to their parents.
    fn link_fetched(
        &mut self,
        pending: &[ObjectId],
        relationship: &RelationshipDescriptor,
        target: &Arc<EntityDescriptor>,
        columns: &[ColumnPath],
        by_tuple: &HashMap<JoinTuple, Vec<ObjectId>>,
        rows: &[Row],
    ) -> Result<()> {
        let plan = NodeColumns::for_root(target);
        let labels: Vec<String> = columns.iter().map(ColumnPath::label).collect();
        let mut objects: IndexMap<IdentityKey, (Arc<EntityDescriptor>, RowSnapshot)> =
            IndexMap::new();
        let mut pairs: Vec<(JoinTuple, IdentityKey)> = Vec::with_capacity(rows.len());

        for row in rows {
            let Some(key) = plan.identity_key(&target.name, row) else {
                trace!(entity = %target.name, "Skipping row without primary key");
                continue;
            };
            let tuple = JoinTuple(
                labels
                    .iter()
                    .map(|label| row.get_by_name(label).cloned().unwrap_or(Value::Null))
                    .collect(),
            );
            if !objects.contains_key(&key) {
                objects.insert(key.clone(), (Arc::clone(target), plan.snapshot(row)));
            }
            pairs.push((tuple, key));
        }

        let ids = self.materialize(objects)?;
        let to_many = relationship.kind.is_to_many();
        for &parent in pending {
            self.store
                .get_mut(parent)?
                .set_fault(&relationship.name, Fault::resolved_empty(to_many));
        }

        let mut linked = 0_usize;
        for (tuple, key) in &pairs {
            let (Some(owners), Some(&child)) = (by_tuple.get(tuple), ids.get(key)) else {
                continue;
            };
            if self.store.get(child)?.state() == ObjectState::Deleted {
                continue;
            }
            for &owner in owners {
                if let Some(fault) = self.store.get_mut(owner)?.fault_mut(&relationship.name) {
                    if fault.link(child) {
                        linked += 1;
                    }
                }
            }
        }
        for &parent in pending {
            self.overlay_pending_edits(parent, relationship)?;
        }
        debug!(
            relationship = %relationship.name,
            parents = pending.len(),
            rows = rows.len(),
            links = linked,
            "Resolved disjoint prefetch"
        );
        Ok(())
    }

    /// Join values of a parent for the first hop, if known without a query.
    fn join_tuple(&self, id: ObjectId, hop: &DbRelationship) -> Option<JoinTuple> {
        let entry = self.store.get(id).ok()?;
        let loaded = entry.state().is_loaded();
        let mut values = Vec::with_capacity(hop.joins.len());
        for join in &hop.joins {
            if loaded {
                values.push(entry.value(&join.source).clone());
            } else {
                values.push(entry.key().value(&join.source)?.clone());
            }
        }
        Some(JoinTuple(values))
    }

    /// Run one disjoint query per node of `tree`, parents before children.
    pub(crate) fn resolve_disjoint(
        &mut self,
        tree: &PrefetchTree,
        roots: &[ObjectId],
    ) -> Result<()> {
        let mut reached: HashMap<NodeId, Vec<ObjectId>> = HashMap::new();
        reached.insert(NodeId::ROOT, roots.to_vec());

        for node in tree.nodes().skip(1) {
            let (Some(parent), Some(relationship)) = (node.parent(), node.incoming()) else {
                continue;
            };
            let parents = reached.get(&parent).cloned().unwrap_or_default();
            if parents.is_empty() {
                reached.insert(node.id(), Vec::new());
                continue;
            }
            self.prefetch_relationship(&parents, relationship)
                .map_err(|e| with_query_context(e, &node.entity().name, None, Some(node.path())))?;

            let mut children: Vec<ObjectId> = Vec::new();
            for owner in &parents {
                if let Some(fault) = self.store.get(*owner)?.fault(&relationship.name) {
                    for child in fault.targets() {
                        if !children.contains(child) {
                            children.push(*child);
                        }
                    }
                }
            }
            reached.insert(node.id(), children);
        }
        Ok(())
    }
}
