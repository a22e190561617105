//! Commit: ordering and executing pending writes.
//!
//! Writes run in this order:
//! - INSERT parent-first (so foreign keys can point at fresh rows)
//! - link-table INSERT
//! - UPDATE in registration order
//! - link-table DELETE
//! - DELETE child-first
//!
//! Objects are promoted (rekeyed, snapshots replaced, states advanced) only
//! after every statement succeeded. A failing statement leaves the session as
//! it was; undoing statements already executed is the caller's transaction's job.

use crate::Session;
use crate::cache::SnapshotBatch;
use crate::differ::{ObjectChange, change_for};
use crate::fault::Fault;
use crate::object_store::ObjectId;
use crate::state::{LifecycleEvent, ObjectState};
use objgraph_core::{
    ConflictError, DbEntity, Error, IdentityKey, QueryLayer, RelationshipDescriptor, Result,
    RowSnapshot, Schema, StateErrorKind, Value, WriteKind, WritePayload, WriteResult,
    with_query_context,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A pending change to a link table behind a flattened to-many relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    /// Insert a link row.
    Link {
        /// Owner of the relationship.
        source: ObjectId,
        relationship: String,
        target: ObjectId,
    },
    /// Delete a link row.
    Unlink {
        source: ObjectId,
        relationship: String,
        target: ObjectId,
    },
}

impl LinkOp {
    pub fn link(source: ObjectId, relationship: impl Into<String>, target: ObjectId) -> Self {
        LinkOp::Link {
            source,
            relationship: relationship.into(),
            target,
        }
    }

    pub fn unlink(source: ObjectId, relationship: impl Into<String>, target: ObjectId) -> Self {
        LinkOp::Unlink {
            source,
            relationship: relationship.into(),
            target,
        }
    }

    pub fn source(&self) -> ObjectId {
        match self {
            LinkOp::Link { source, .. } | LinkOp::Unlink { source, .. } => *source,
        }
    }

    pub fn target(&self) -> ObjectId {
        match self {
            LinkOp::Link { target, .. } | LinkOp::Unlink { target, .. } => *target,
        }
    }

    pub fn relationship(&self) -> &str {
        match self {
            LinkOp::Link { relationship, .. } | LinkOp::Unlink { relationship, .. } => relationship,
        }
    }

    pub fn is_link(&self) -> bool {
        matches!(self, LinkOp::Link { .. })
    }

    pub fn is_unlink(&self) -> bool {
        matches!(self, LinkOp::Unlink { .. })
    }

    /// The operation undoing this one.
    pub fn opposite(&self) -> LinkOp {
        match self {
            LinkOp::Link {
                source,
                relationship,
                target,
            } => LinkOp::unlink(*source, relationship.clone(), *target),
            LinkOp::Unlink {
                source,
                relationship,
                target,
            } => LinkOp::link(*source, relationship.clone(), *target),
        }
    }

    pub fn involves(&self, id: ObjectId) -> bool {
        self.source() == id || self.target() == id
    }
}

/// Orders writes so foreign keys are satisfied.
///
/// A table depends on every table its to-one relationships point at by
/// primary key. Ranks come from a topological sort; tables caught in a cycle
/// keep their declaration order after the others.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Table -> position in parent-first order.
    ranks: HashMap<String, usize>,
}

impl FlushOrderer {
    pub fn new(schema: &Schema) -> Self {
        let tables: Vec<&str> = schema.db_entities().map(|t| t.name.as_str()).collect();
        let mut depends_on: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for table in schema.db_entities() {
            for relationship in &table.relationships {
                if relationship.to_many
                    || relationship.target == table.name
                    || !schema.joins_target_key(relationship)
                {
                    continue;
                }
                let parents = depends_on.entry(table.name.as_str()).or_default();
                if !parents.contains(&relationship.target.as_str()) {
                    parents.push(relationship.target.as_str());
                    dependents
                        .entry(relationship.target.as_str())
                        .or_default()
                        .push(table.name.as_str());
                }
            }
        }

        let mut remaining: HashMap<&str, usize> = tables
            .iter()
            .map(|t| (*t, depends_on.get(t).map_or(0, Vec::len)))
            .collect();
        let mut queue: VecDeque<&str> = tables
            .iter()
            .copied()
            .filter(|t| remaining.get(t).copied() == Some(0))
            .collect();
        let mut ranks = HashMap::with_capacity(tables.len());

        while let Some(table) = queue.pop_front() {
            ranks.insert(table.to_string(), ranks.len());
            for child in dependents.get(table).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }

        if ranks.len() < tables.len() {
            let cyclic: Vec<&str> = tables
                .iter()
                .copied()
                .filter(|t| !ranks.contains_key(*t))
                .collect();
            warn!(tables = ?cyclic, "Foreign-key cycle between tables; using declaration order");
            for table in cyclic {
                ranks.insert(table.to_string(), ranks.len());
            }
        }
        Self { ranks }
    }

    /// Position of a table in parent-first order.
    pub fn rank(&self, table: &str) -> usize {
        self.ranks.get(table).copied().unwrap_or(usize::MAX)
    }

    /// Split changes into an ordered plan. Sorting is stable, so objects of
    /// one table keep registration order.
    pub fn order(&self, changes: Vec<ObjectChange>) -> FlushPlan {
        let mut plan = FlushPlan::default();
        for change in changes {
            match change.kind {
                WriteKind::Insert => plan.inserts.push(change),
                WriteKind::Update => plan.updates.push(change),
                WriteKind::Delete => plan.deletes.push(change),
            }
        }
        plan.inserts
            .sort_by_key(|c| self.rank(&c.entity.db_entity));
        plan.deletes
            .sort_by_key(|c| std::cmp::Reverse(self.rank(&c.entity.db_entity)));
        plan
    }
}

/// Ordered writes of one commit.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Parent-first.
    pub inserts: Vec<ObjectChange>,
    pub updates: Vec<ObjectChange>,
    /// Child-first.
    pub deletes: Vec<ObjectChange>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

/// What a commit did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Link rows inserted.
    pub linked: usize,
    /// Link rows deleted.
    pub unlinked: usize,
}

impl CommitSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.linked + self.unlinked
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Permanent identity and persisted row of an inserted object.
#[derive(Debug)]
struct Inserted {
    key: IdentityKey,
    values: RowSnapshot,
}

impl<Q: QueryLayer> Session<Q> {
    /// Persist every pending change.
    ///
    /// All-or-nothing for the session: on error no object changes state.
    #[tracing::instrument(level = "info", skip(self), fields(session = self.id))]
    pub fn commit_changes(&mut self) -> Result<CommitSummary> {
        self.sync_peers();

        let changes: Vec<ObjectChange> = self
            .store
            .iter()
            .filter_map(|(id, entry)| {
                change_for(id, entry).or_else(|| {
                    (entry.state() == ObjectState::Modified).then(|| ObjectChange {
                        id,
                        kind: WriteKind::Update,
                        key: entry.key().clone(),
                        entity: Arc::clone(entry.entity()),
                        values: RowSnapshot::new(),
                    })
                })
            })
            .collect();
        let plan = FlushOrderer::new(&self.schema).order(changes);
        info!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            links = self.link_ops.len(),
            "Executing commit"
        );

        let owners_of = self.new_owners();
        let mut summary = CommitSummary::default();
        let mut assigned: HashMap<ObjectId, Inserted> = HashMap::new();
        let mut updated: Vec<(ObjectId, RowSnapshot)> = Vec::new();

        for change in &plan.inserts {
            let mut values = change.values.clone();
            self.propagate_keys(change.id, &mut values, &assigned, &owners_of)?;
            let payload = WritePayload {
                key: change.key.clone(),
                values,
            };
            let result = self.execute_statement(
                WriteKind::Insert,
                &change.entity.db_entity,
                &payload,
                &change.entity.name,
            )?;

            let mut values = payload.values;
            if let Some(generated) = &result.generated_key {
                values.apply_diff(generated);
            }
            let key = permanent_key(&change.entity.name, change.entity.primary_key(), &values)?;
            debug!(object = %change.id, key = %key, "Inserted");
            assigned.insert(change.id, Inserted { key, values });
            summary.inserted += 1;
        }

        let (links, unlinks): (Vec<LinkOp>, Vec<LinkOp>) =
            self.link_ops.iter().cloned().partition(LinkOp::is_link);
        for op in &links {
            let (table, row) = self.link_row(op, &assigned)?;
            let payload = WritePayload {
                key: IdentityKey::new(table.name.clone(), row.iter().map(|(c, v)| (c, v.clone()))),
                values: row,
            };
            self.execute_statement(WriteKind::Insert, &table.name, &payload, &table.name)?;
            summary.linked += 1;
        }

        for change in &plan.updates {
            let mut values = change.values.clone();
            self.propagate_keys(change.id, &mut values, &assigned, &owners_of)?;
            if !values.is_empty() {
                let payload = WritePayload {
                    key: change.key.clone(),
                    values,
                };
                self.execute_statement(
                    WriteKind::Update,
                    &change.entity.db_entity,
                    &payload,
                    &change.entity.name,
                )?;
                summary.updated += 1;
                updated.push((change.id, payload.values));
            } else {
                updated.push((change.id, values));
            }
        }

        for op in &unlinks {
            let (table, row) = self.link_row(op, &assigned)?;
            let payload = WritePayload {
                key: IdentityKey::new(table.name.clone(), row.iter().map(|(c, v)| (c, v.clone()))),
                values: RowSnapshot::new(),
            };
            self.execute_statement(WriteKind::Delete, &table.name, &payload, &table.name)?;
            summary.unlinked += 1;
        }

        for change in &plan.deletes {
            let payload = WritePayload {
                key: change.key.clone(),
                values: RowSnapshot::new(),
            };
            self.execute_statement(
                WriteKind::Delete,
                &change.entity.db_entity,
                &payload,
                &change.entity.name,
            )?;
            summary.deleted += 1;
        }

        self.promote(assigned, updated, &plan)?;
        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            linked = summary.linked,
            unlinked = summary.unlinked,
            "Commit complete"
        );
        Ok(summary)
    }

    /// Execute one statement, requiring exactly one affected row.
    fn execute_statement(
        &self,
        kind: WriteKind,
        table: &str,
        payload: &WritePayload,
        entity: &str,
    ) -> Result<WriteResult> {
        let db_entity = self.schema.db_entity(table)?;
        let result = self
            .query
            .execute_write(kind, db_entity, payload)
            .map_err(|e| with_query_context(e, entity, Some(&payload.key), None))?;
        if result.affected != 1 {
            warn!(
                statement = %kind,
                key = %payload.key,
                affected = result.affected,
                "Write conflict"
            );
            return Err(Error::Conflict(ConflictError {
                statement: kind.as_str(),
                entity: entity.to_string(),
                key: payload.key.to_string(),
                affected: result.affected,
            }));
        }
        Ok(result)
    }

    /// NEW owners of non-flattened to-many slots, by child.
    fn new_owners(&self) -> HashMap<ObjectId, Vec<(ObjectId, RelationshipDescriptor)>> {
        let mut owners: HashMap<ObjectId, Vec<(ObjectId, RelationshipDescriptor)>> = HashMap::new();
        for (owner, entry) in self.store.iter() {
            if entry.state() != ObjectState::New {
                continue;
            }
            for relationship in &entry.entity().relationships {
                if !relationship.kind.is_to_many() || relationship.kind.is_flattened() {
                    continue;
                }
                if let Some(fault) = entry.fault(&relationship.name) {
                    for child in fault.targets() {
                        owners
                            .entry(*child)
                            .or_default()
                            .push((owner, relationship.clone()));
                    }
                }
            }
        }
        owners
    }

    /// Fill foreign-key columns pointing at objects inserted earlier in this commit.
    fn propagate_keys(
        &self,
        id: ObjectId,
        values: &mut RowSnapshot,
        assigned: &HashMap<ObjectId, Inserted>,
        owners_of: &HashMap<ObjectId, Vec<(ObjectId, RelationshipDescriptor)>>,
    ) -> Result<()> {
        let entry = self.store.get(id)?;
        for relationship in &entry.entity().relationships {
            if relationship.kind.is_to_many() || relationship.kind.is_flattened() {
                continue;
            }
            let Some(Fault::ToOne(Some(target))) = entry.fault(&relationship.name) else {
                continue;
            };
            let Some(hop) = relationship.first_hop() else {
                continue;
            };
            match assigned.get(target) {
                Some(parent) => {
                    for join in &hop.joins {
                        values.insert(
                            join.source.clone(),
                            parent.values.get_or_null(&join.target).clone(),
                        );
                    }
                }
                None if self.store.get(*target)?.state() == ObjectState::New => {
                    warn!(
                        object = %id,
                        relationship = %relationship.name,
                        "Target not inserted yet; foreign key left NULL"
                    );
                }
                None => {}
            }
        }

        for (owner, relationship) in owners_of.get(&id).into_iter().flatten() {
            let (Some(parent), Some(hop)) = (assigned.get(owner), relationship.first_hop()) else {
                continue;
            };
            for join in &hop.joins {
                values.insert(
                    join.target.clone(),
                    parent.values.get_or_null(&join.source).clone(),
                );
            }
        }
        Ok(())
    }

    /// Current value of a column, preferring values assigned by this commit.
    fn column_value(
        &self,
        id: ObjectId,
        column: &str,
        assigned: &HashMap<ObjectId, Inserted>,
    ) -> Result<Value> {
        if let Some(inserted) = assigned.get(&id) {
            return Ok(inserted.values.get_or_null(column).clone());
        }
        let entry = self.store.get(id)?;
        Ok(entry
            .key()
            .value(column)
            .cloned()
            .unwrap_or_else(|| entry.value(column).clone()))
    }

    /// Link-table row for a flattened relationship edit.
    fn link_row(
        &self,
        op: &LinkOp,
        assigned: &HashMap<ObjectId, Inserted>,
    ) -> Result<(Arc<DbEntity>, RowSnapshot)> {
        let relationship = self.relationship_of(op.source(), op.relationship())?;
        let [first, second] = relationship.db_path.as_slice() else {
            return Err(Error::state(
                StateErrorKind::IllegalTransition,
                format!("{} does not go through a single link table", relationship.name),
            ));
        };
        let table = Arc::clone(self.schema.db_entity(&first.target)?);
        let mut row = RowSnapshot::new();
        for join in &first.joins {
            row.insert(
                join.target.clone(),
                self.column_value(op.source(), &join.source, assigned)?,
            );
        }
        for join in &second.joins {
            row.insert(
                join.source.clone(),
                self.column_value(op.target(), &join.target, assigned)?,
            );
        }
        Ok((table, row))
    }

    /// Apply a successful commit to the store and the shared cache.
    fn promote(
        &mut self,
        assigned: HashMap<ObjectId, Inserted>,
        updated: Vec<(ObjectId, RowSnapshot)>,
        plan: &FlushPlan,
    ) -> Result<()> {
        let mut batch = SnapshotBatch::new(Some(self.id));

        for change in &plan.inserts {
            let Some(inserted) = assigned.get(&change.id) else {
                continue;
            };
            self.store.rekey(change.id, inserted.key.clone())?;
            let entry = self.store.get_mut(change.id)?;
            entry.load(Arc::new(inserted.values.clone()));
            entry.transition(LifecycleEvent::Commit)?;
            batch
                .inserted
                .insert(inserted.key.clone(), inserted.values.clone());
        }

        for (id, sent) in updated {
            let entry = self.store.get_mut(id)?;
            entry.values_mut().apply_diff(&sent);
            entry.set_committed(Some(Arc::new(entry.values().clone())));
            entry.transition(LifecycleEvent::Commit)?;
            if !sent.is_empty() {
                batch.modified.insert(entry.key().clone(), sent);
            }
        }

        let deleted: Vec<ObjectId> = self
            .store
            .iter()
            .filter(|(_, entry)| entry.state() == ObjectState::Deleted)
            .map(|(id, _)| id)
            .collect();
        for id in deleted {
            if let Some(entry) = self.store.remove(id) {
                if !entry.key().is_temporary() {
                    batch.deleted.insert(entry.key().clone());
                }
            }
            self.unlink_everywhere(id);
        }

        self.link_ops.clear();
        if !batch.is_empty() {
            self.cache.apply_batch(batch);
        }
        Ok(())
    }

    /// Remove every reference to `id` from resolved slots.
    pub(crate) fn unlink_everywhere(&mut self, id: ObjectId) {
        for owner in self.store.ids() {
            if let Ok(entry) = self.store.get_mut(owner) {
                for fault in entry.faults_mut() {
                    fault.unlink(id);
                }
            }
        }
    }
}

/// Identity of an inserted row from its persisted values.
fn permanent_key(
    entity: &str,
    primary_key: &[String],
    values: &RowSnapshot,
) -> Result<IdentityKey> {
    let mut key: Vec<(&str, Value)> = Vec::with_capacity(primary_key.len());
    for column in primary_key {
        let value = values.get_or_null(column);
        if value.is_null() {
            return Err(Error::Custom(format!(
                "insert of {entity} produced no value for primary key column {column}"
            )));
        }
        key.push((column.as_str(), value.clone()));
    }
    Ok(IdentityKey::new(entity, key))
}
