//! Relationship editing.
//!
//! Edits keep both sides consistent in memory: foreign-key columns are
//! rewritten, and the inverse slot on the other object is updated when it is
//! already resolved (unresolved inverses will fetch the new state after commit).
//! Edits through a link table are queued as [`LinkOp`]s.

use crate::Session;
use crate::commit::LinkOp;
use crate::fault::Fault;
use crate::object_store::ObjectId;
use crate::state::{LifecycleEvent, ObjectState};
use objgraph_core::{
    Error, QueryLayer, RelationshipDescriptor, Result, StateErrorKind, Value,
};
use tracing::trace;

impl<Q: QueryLayer> Session<Q> {
    /// Point a to-one relationship at `target`, or clear it.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn set_to_one(
        &mut self,
        id: ObjectId,
        relationship: &str,
        target: Option<ObjectId>,
    ) -> Result<()> {
        self.sync_peers();
        let descriptor = self.relationship_of(id, relationship)?;
        if descriptor.kind.is_to_many() {
            return Err(wrong_arity(&descriptor, "to-many"));
        }
        if descriptor.kind.is_flattened() {
            return Err(not_editable(&descriptor));
        }
        if let Some(target) = target {
            self.check_target(&descriptor, target)?;
        }
        self.resolve(id)?;
        let previous = match self.fire_fault(id, &descriptor)? {
            Fault::ToOne(previous) => previous,
            _ => None,
        };

        let Some(hop) = descriptor.first_hop() else {
            return Ok(());
        };
        let mut foreign_key = Vec::with_capacity(hop.joins.len());
        for join in &hop.joins {
            let value = match target {
                Some(target) => self.key_or_value(target, &join.target)?,
                None => Value::Null,
            };
            foreign_key.push((join.source.clone(), value));
        }

        let entry = self.store.get_mut(id)?;
        entry.transition(LifecycleEvent::Write)?;
        for (column, value) in foreign_key {
            entry.values_mut().insert(column, value);
        }
        entry.set_fault(&descriptor.name, Fault::ToOne(target));

        if previous != target {
            if let Some(inverse) = self.inverse_of(&descriptor) {
                if let Some(previous) = previous {
                    self.unlink_resolved(previous, &inverse.name, id)?;
                }
                if let Some(target) = target {
                    self.link_resolved(target, &inverse.name, id)?;
                }
            }
        }
        trace!(object = %id, relationship = %descriptor.name, "Set to-one");
        Ok(())
    }

    /// Add `child` to a to-many relationship.
    pub fn add_to_many(&mut self, id: ObjectId, relationship: &str, child: ObjectId) -> Result<()> {
        self.edit_to_many(id, relationship, child, true)
    }

    /// Remove `child` from a to-many relationship.
    pub fn remove_from_many(
        &mut self,
        id: ObjectId,
        relationship: &str,
        child: ObjectId,
    ) -> Result<()> {
        self.edit_to_many(id, relationship, child, false)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    fn edit_to_many(
        &mut self,
        id: ObjectId,
        relationship: &str,
        child: ObjectId,
        add: bool,
    ) -> Result<()> {
        self.sync_peers();
        let descriptor = self.relationship_of(id, relationship)?;
        if !descriptor.kind.is_to_many() {
            return Err(wrong_arity(&descriptor, "to-one"));
        }
        self.check_target(&descriptor, child)?;
        if self.store.get(id)?.state() == ObjectState::Deleted {
            return Err(Error::state(
                StateErrorKind::IllegalTransition,
                format!("cannot edit {} of a DELETED object", descriptor.name),
            ));
        }
        let current = self.fire_fault(id, &descriptor)?;
        if current.targets().contains(&child) == add {
            return Ok(());
        }

        if descriptor.kind.is_flattened() {
            if descriptor.db_path.len() != 2 {
                return Err(not_editable(&descriptor));
            }
            let op = if add {
                LinkOp::link(id, descriptor.name.clone(), child)
            } else {
                LinkOp::unlink(id, descriptor.name.clone(), child)
            };
            let opposite = op.opposite();
            if let Some(position) = self.link_ops.iter().position(|pending| *pending == opposite) {
                self.link_ops.remove(position);
            } else {
                self.link_ops.push(op);
            }
        } else {
            self.move_child(id, &descriptor, child, add)?;
        }

        if let Some(fault) = self.store.get_mut(id)?.fault_mut(&descriptor.name) {
            if add {
                fault.link(child);
            } else {
                fault.unlink(child);
            }
        }
        if descriptor.kind.is_flattened() {
            if let Some(inverse) = self.inverse_of(&descriptor) {
                if add {
                    self.link_resolved(child, &inverse.name, id)?;
                } else {
                    self.unlink_resolved(child, &inverse.name, id)?;
                }
            }
        }
        trace!(
            object = %id,
            relationship = %descriptor.name,
            child = %child,
            add,
            "Edited to-many"
        );
        Ok(())
    }

    /// Rewrite a child's foreign key for a plain to-many edit.
    fn move_child(
        &mut self,
        owner: ObjectId,
        descriptor: &RelationshipDescriptor,
        child: ObjectId,
        add: bool,
    ) -> Result<()> {
        let Some(hop) = descriptor.first_hop() else {
            return Ok(());
        };
        self.resolve(child)?;
        let mut foreign_key = Vec::with_capacity(hop.joins.len());
        for join in &hop.joins {
            let value = if add {
                self.key_or_value(owner, &join.source)?
            } else {
                Value::Null
            };
            foreign_key.push((join.target.clone(), value));
        }

        let entry = self.store.get_mut(child)?;
        entry.transition(LifecycleEvent::Write)?;
        for (column, value) in foreign_key {
            entry.values_mut().insert(column, value);
        }

        // A child has one owner through a foreign key.
        if add {
            let previous: Vec<ObjectId> = self
                .store
                .iter()
                .filter(|(id, entry)| {
                    *id != owner
                        && entry.entity().name == descriptor.source
                        && entry
                            .fault(&descriptor.name)
                            .is_some_and(|f| f.targets().contains(&child))
                })
                .map(|(id, _)| id)
                .collect();
            for previous in previous {
                self.unlink_resolved(previous, &descriptor.name, child)?;
            }
        }
        if let Some(inverse) = self.inverse_of(descriptor) {
            let slot = if add { Some(owner) } else { None };
            self.store
                .get_mut(child)?
                .set_fault(&inverse.name, Fault::ToOne(slot));
        }
        Ok(())
    }

    /// The relationship walking the same physical chain backwards, if mapped.
    pub(crate) fn inverse_of(
        &self,
        relationship: &RelationshipDescriptor,
    ) -> Option<RelationshipDescriptor> {
        let target = self.schema.entity(&relationship.target).ok()?;
        target
            .relationships
            .iter()
            .find(|candidate| {
                candidate.target == relationship.source
                    && candidate.db_path.len() == relationship.db_path.len()
                    && candidate
                        .db_path
                        .iter()
                        .zip(relationship.db_path.iter().rev())
                        .all(|(a, b)| a.is_reverse_of(b))
            })
            .cloned()
    }

    /// Reapply uncommitted edits to a to-many slot just filled from fetched rows.
    ///
    /// Flattened slots replay the pending link operations naming them, from
    /// either side. Plain slots follow the foreign keys of NEW and MODIFIED
    /// children: a child pointing at the owner is linked, one pointing
    /// elsewhere is dropped.
    pub(crate) fn overlay_pending_edits(
        &mut self,
        owner: ObjectId,
        relationship: &RelationshipDescriptor,
    ) -> Result<()> {
        if !relationship.kind.is_to_many() {
            return Ok(());
        }
        let mut edits: Vec<(ObjectId, bool)> = Vec::new();
        if relationship.kind.is_flattened() {
            for op in &self.link_ops {
                if op.source() == owner && op.relationship() == relationship.name {
                    edits.push((op.target(), op.is_link()));
                } else if op.target() == owner && self.is_inverse_edit(op, relationship) {
                    edits.push((op.source(), op.is_link()));
                }
            }
        } else {
            let Some(hop) = relationship.first_hop() else {
                return Ok(());
            };
            let mut owner_key = Vec::with_capacity(hop.joins.len());
            for join in &hop.joins {
                owner_key.push(self.key_or_value(owner, &join.source)?);
            }
            if owner_key.iter().any(Value::is_null) {
                return Ok(());
            }
            for (id, entry) in self.store.iter() {
                if entry.entity().name != relationship.target
                    || !matches!(entry.state(), ObjectState::New | ObjectState::Modified)
                {
                    continue;
                }
                let points_here = hop
                    .joins
                    .iter()
                    .zip(&owner_key)
                    .all(|(join, value)| entry.value(&join.target).same_as(value));
                edits.push((id, points_here));
            }
        }

        if edits.is_empty() {
            return Ok(());
        }
        if let Some(fault) = self.store.get_mut(owner)?.fault_mut(&relationship.name) {
            for (child, linked) in edits {
                if linked {
                    fault.link(child);
                } else {
                    fault.unlink(child);
                }
            }
        }
        trace!(object = %owner, relationship = %relationship.name, "Reapplied pending edits");
        Ok(())
    }

    /// Whether a pending link operation edits `relationship` from its other side.
    fn is_inverse_edit(&self, op: &LinkOp, relationship: &RelationshipDescriptor) -> bool {
        self.relationship_of(op.source(), op.relationship())
            .ok()
            .and_then(|edited| self.inverse_of(&edited))
            .is_some_and(|inverse| inverse.name == relationship.name)
    }

    fn link_resolved(&mut self, owner: ObjectId, relationship: &str, id: ObjectId) -> Result<()> {
        if let Some(fault) = self.store.get_mut(owner)?.fault_mut(relationship) {
            fault.link(id);
        }
        Ok(())
    }

    fn unlink_resolved(&mut self, owner: ObjectId, relationship: &str, id: ObjectId) -> Result<()> {
        if let Some(fault) = self.store.get_mut(owner)?.fault_mut(relationship) {
            fault.unlink(id);
        }
        Ok(())
    }

    /// A column of an object's identity, falling back to its loaded values.
    fn key_or_value(&self, id: ObjectId, column: &str) -> Result<Value> {
        let entry = self.store.get(id)?;
        Ok(entry
            .key()
            .value(column)
            .cloned()
            .unwrap_or_else(|| entry.value(column).clone()))
    }

    fn check_target(&self, descriptor: &RelationshipDescriptor, target: ObjectId) -> Result<()> {
        let entry = self.store.get(target)?;
        if entry.entity().name != descriptor.target {
            return Err(Error::state(
                StateErrorKind::WrongArity,
                format!(
                    "{} expects {}, got {} {}",
                    descriptor.name,
                    descriptor.target,
                    entry.entity().name,
                    target
                ),
            ));
        }
        Ok(())
    }
}

fn wrong_arity(descriptor: &RelationshipDescriptor, kind: &str) -> Error {
    Error::state(
        StateErrorKind::WrongArity,
        format!("{} is a {kind} relationship", descriptor.name),
    )
}

fn not_editable(descriptor: &RelationshipDescriptor) -> Error {
    Error::state(
        StateErrorKind::IllegalTransition,
        format!(
            "{} spans {} joins and cannot be edited directly",
            descriptor.name,
            descriptor.db_path.len()
        ),
    )
}
