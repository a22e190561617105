//! Relationship faults.
//!
//! Every relationship slot of an object holds a [`Fault`]. An unresolved fault
//! knows nothing but the owner and the relationship; touching it runs one
//! query (or, for a to-one pointing at a primary key, no query at all) and
//! replaces it with the real value.

use crate::Session;
use crate::object_store::ObjectId;
use crate::state::ObjectState;
use objgraph_core::{
    Error, IdentityKey, QueryLayer, RelationshipDescriptor, Result, StateErrorKind, Value,
};
use tracing::trace;

/// Contents of one relationship slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Fault {
    /// Not fetched yet.
    #[default]
    Unresolved,
    /// Resolved to-one value.
    ToOne(Option<ObjectId>),
    /// Resolved to-many collection, in first-seen order, without duplicates.
    ToMany(Vec<ObjectId>),
}

impl Fault {
    /// A resolved slot holding nothing.
    pub fn resolved_empty(to_many: bool) -> Self {
        if to_many {
            Fault::ToMany(Vec::new())
        } else {
            Fault::ToOne(None)
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Fault::Unresolved)
    }

    /// Add `id` to a resolved to-many, or set a resolved to-one.
    ///
    /// Returns false when a to-many already holds `id`.
    pub fn link(&mut self, id: ObjectId) -> bool {
        match self {
            Fault::ToMany(items) => {
                if items.contains(&id) {
                    false
                } else {
                    items.push(id);
                    true
                }
            }
            Fault::ToOne(slot) => {
                *slot = Some(id);
                true
            }
            Fault::Unresolved => false,
        }
    }

    /// Drop `id` from the slot. Returns true if it was there.
    pub fn unlink(&mut self, id: ObjectId) -> bool {
        match self {
            Fault::ToMany(items) => {
                let before = items.len();
                items.retain(|item| *item != id);
                items.len() != before
            }
            Fault::ToOne(slot) if *slot == Some(id) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Objects currently held by a resolved slot.
    pub fn targets(&self) -> &[ObjectId] {
        match self {
            Fault::ToMany(items) => items,
            Fault::ToOne(Some(id)) => std::slice::from_ref(id),
            Fault::ToOne(None) | Fault::Unresolved => &[],
        }
    }
}

impl<Q: QueryLayer> Session<Q> {
    /// Read a to-one relationship, firing its fault if needed.
    pub fn to_one(&mut self, id: ObjectId, relationship: &str) -> Result<Option<ObjectId>> {
        self.sync_peers();
        let descriptor = self.relationship_of(id, relationship)?;
        if descriptor.kind.is_to_many() {
            return Err(Error::state(
                StateErrorKind::WrongArity,
                format!("{} is a to-many relationship", descriptor.name),
            ));
        }
        match self.fire_fault(id, &descriptor)? {
            Fault::ToOne(target) => Ok(target),
            _ => Ok(None),
        }
    }

    /// Read a to-many relationship, firing its fault if needed.
    pub fn to_many(&mut self, id: ObjectId, relationship: &str) -> Result<Vec<ObjectId>> {
        self.sync_peers();
        let descriptor = self.relationship_of(id, relationship)?;
        if !descriptor.kind.is_to_many() {
            return Err(Error::state(
                StateErrorKind::WrongArity,
                format!("{} is a to-one relationship", descriptor.name),
            ));
        }
        Ok(self.fire_fault(id, &descriptor)?.targets().to_vec())
    }

    /// Current state of a relationship slot without firing it.
    pub fn fault(&self, id: ObjectId, relationship: &str) -> Result<Fault> {
        Ok(self
            .store
            .get(id)?
            .fault(relationship)
            .cloned()
            .unwrap_or_default())
    }

    /// Resolve a slot if needed and return its contents.
    pub(crate) fn fire_fault(
        &mut self,
        id: ObjectId,
        relationship: &RelationshipDescriptor,
    ) -> Result<Fault> {
        let entry = self.store.get(id)?;
        if let Some(fault) = entry.fault(&relationship.name) {
            if fault.is_resolved() {
                return Ok(fault.clone());
            }
        }
        let owner_entity = entry.entity().name.clone();
        match entry.state() {
            ObjectState::Deleted => {
                return Err(Error::state(
                    StateErrorKind::IllegalTransition,
                    format!("cannot fault {} of a deleted object", relationship.name),
                ));
            }
            ObjectState::New => {
                let empty = Fault::resolved_empty(relationship.kind.is_to_many());
                self.store
                    .get_mut(id)?
                    .set_fault(&relationship.name, empty.clone());
                return Ok(empty);
            }
            _ => {}
        }

        self.fault_stats.record(&owner_entity, &relationship.name);

        if let Some(key) = self.to_one_by_foreign_key(id, relationship)? {
            let fault = match key {
                Some(key) => {
                    let target = self.register_hollow(key)?;
                    Fault::ToOne(Some(target))
                }
                None => Fault::ToOne(None),
            };
            trace!(
                object = %id,
                relationship = %relationship.name,
                "Resolved to-one fault from foreign key"
            );
            self.store
                .get_mut(id)?
                .set_fault(&relationship.name, fault.clone());
            return Ok(fault);
        }

        if let Err(err) = self.prefetch_relationship(&[id], relationship) {
            self.staged.clear();
            return Err(err);
        }
        self.publish_staged();
        Ok(self
            .store
            .get(id)?
            .fault(&relationship.name)
            .cloned()
            .unwrap_or_else(|| Fault::resolved_empty(relationship.kind.is_to_many())))
    }

    /// For a plain to-one joining the target's primary key, build the target's
    /// identity from the owner's foreign-key columns.
    ///
    /// Returns `Ok(None)` when the relationship does not have that shape,
    /// `Ok(Some(None))` when a foreign-key column is NULL.
    fn to_one_by_foreign_key(
        &mut self,
        id: ObjectId,
        relationship: &RelationshipDescriptor,
    ) -> Result<Option<Option<IdentityKey>>> {
        if relationship.kind.is_to_many() || relationship.kind.is_flattened() {
            return Ok(None);
        }
        let Some(hop) = relationship.first_hop() else {
            return Ok(None);
        };
        if !self.schema.joins_target_key(hop) {
            return Ok(None);
        }

        self.resolve(id)?;
        let entry = self.store.get(id)?;
        let mut values: Vec<(&str, Value)> = Vec::with_capacity(hop.joins.len());
        for join in &hop.joins {
            let value = entry.value(&join.source);
            if value.is_null() {
                return Ok(Some(None));
            }
            values.push((join.target.as_str(), value.clone()));
        }
        Ok(Some(Some(IdentityKey::new(
            relationship.target.as_str(),
            values,
        ))))
    }
}
