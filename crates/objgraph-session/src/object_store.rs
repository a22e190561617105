//! Per-session object store with identity mapping.
//!
//! Every object a session knows about lives here exactly once, addressed by an
//! [`ObjectId`] handle and indexed by its [`IdentityKey`]:
//!
//! - **Uniqueness**: registering a key twice returns the first handle
//! - **Ownership**: callers hold handles, never the objects themselves
//! - **Rekeying**: a NEW object's temporary key is swapped for the permanent
//!   one after its insert succeeds, keeping the same handle

use crate::fault::Fault;
use crate::state::{LifecycleEvent, ObjectState};
use indexmap::IndexMap;
use objgraph_core::{
    EntityDescriptor, Error, IdentityKey, Result, RowSnapshot, StateErrorKind, Value,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to an object owned by a session.
///
/// Handles are unique for the whole process, so a handle from one session is
/// never mistaken for an object of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Allocate a fresh handle.
    pub fn next() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One tracked object.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    key: IdentityKey,
    entity: Arc<EntityDescriptor>,
    state: ObjectState,
    /// Current column values. Empty while HOLLOW.
    values: RowSnapshot,
    /// Last persisted state, shared with the snapshot cache.
    committed: Option<Arc<RowSnapshot>>,
    faults: HashMap<String, Fault>,
}

impl ObjectEntry {
    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn entity(&self) -> &Arc<EntityDescriptor> {
        &self.entity
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Current values keyed by column name.
    pub fn values(&self) -> &RowSnapshot {
        &self.values
    }

    pub fn committed(&self) -> Option<&Arc<RowSnapshot>> {
        self.committed.as_ref()
    }

    /// Current value of a column, NULL when absent.
    pub fn value(&self, column: &str) -> &Value {
        self.values.get_or_null(column)
    }

    /// Relationship slot, `None` when never touched.
    pub fn fault(&self, relationship: &str) -> Option<&Fault> {
        self.faults.get(relationship)
    }

    pub(crate) fn fault_mut(&mut self, relationship: &str) -> Option<&mut Fault> {
        self.faults.get_mut(relationship)
    }

    pub(crate) fn set_fault(&mut self, relationship: &str, fault: Fault) {
        self.faults.insert(relationship.to_string(), fault);
    }

    pub(crate) fn faults_mut(&mut self) -> impl Iterator<Item = &mut Fault> {
        self.faults.values_mut()
    }

    /// Forget every resolved relationship.
    pub(crate) fn reset_faults(&mut self) {
        self.faults.clear();
    }

    pub(crate) fn transition(&mut self, event: LifecycleEvent) -> Result<()> {
        self.state = self.state.on(event)?;
        Ok(())
    }

    /// Replace both current and committed values with a persisted snapshot.
    pub(crate) fn load(&mut self, snapshot: Arc<RowSnapshot>) {
        self.values = (*snapshot).clone();
        self.committed = Some(snapshot);
    }

    pub(crate) fn set_committed(&mut self, snapshot: Option<Arc<RowSnapshot>>) {
        self.committed = snapshot;
    }

    pub(crate) fn values_mut(&mut self) -> &mut RowSnapshot {
        &mut self.values
    }

    /// Drop loaded data, keeping identity.
    pub(crate) fn unload(&mut self) {
        self.values = RowSnapshot::new();
        self.committed = None;
    }
}

/// The identity-mapped set of objects of one session.
#[derive(Debug, Default, Clone)]
pub struct ObjectStore {
    objects: IndexMap<ObjectId, ObjectEntry>,
    by_key: HashMap<IdentityKey, ObjectId>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ObjectId) -> Result<&ObjectEntry> {
        self.objects.get(&id).ok_or_else(|| not_registered(id))
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Result<&mut ObjectEntry> {
        self.objects.get_mut(&id).ok_or_else(|| not_registered(id))
    }

    /// Handle registered for a key, if any.
    pub fn lookup(&self, key: &IdentityKey) -> Option<ObjectId> {
        self.by_key.get(key).copied()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Return the handle for `key`, creating a HOLLOW object if the key is new.
    ///
    /// The boolean is true when an object was created.
    pub(crate) fn register_hollow(
        &mut self,
        key: IdentityKey,
        entity: Arc<EntityDescriptor>,
    ) -> Result<(ObjectId, bool)> {
        if let Some(id) = self.lookup(&key) {
            return Ok((id, false));
        }
        let id = ObjectId::next();
        self.objects.insert(
            id,
            ObjectEntry {
                state: ObjectState::Transient.on(LifecycleEvent::RegisterHollow)?,
                key: key.clone(),
                entity,
                values: RowSnapshot::new(),
                committed: None,
                faults: HashMap::new(),
            },
        );
        self.by_key.insert(key, id);
        Ok((id, true))
    }

    /// Register a NEW object under a temporary key.
    ///
    /// Every relationship starts resolved and empty.
    pub(crate) fn register_new(
        &mut self,
        entity: Arc<EntityDescriptor>,
        values: RowSnapshot,
    ) -> Result<ObjectId> {
        let key = IdentityKey::temporary(entity.name.clone());
        let faults = entity
            .relationships
            .iter()
            .map(|r| (r.name.clone(), Fault::resolved_empty(r.kind.is_to_many())))
            .collect();
        let id = ObjectId::next();
        self.objects.insert(
            id,
            ObjectEntry {
                state: ObjectState::Transient.on(LifecycleEvent::RegisterNew)?,
                key: key.clone(),
                entity,
                values,
                committed: None,
                faults,
            },
        );
        self.by_key.insert(key, id);
        Ok(id)
    }

    /// Move an object to a new identity key.
    pub(crate) fn rekey(&mut self, id: ObjectId, key: IdentityKey) -> Result<()> {
        if let Some(existing) = self.lookup(&key) {
            if existing != id {
                return Err(Error::state(
                    StateErrorKind::IllegalTransition,
                    format!("{key} is already registered as {existing}"),
                ));
            }
        }
        let entry = self.get_mut(id)?;
        let old = std::mem::replace(&mut entry.key, key.clone());
        self.by_key.remove(&old);
        self.by_key.insert(key, id);
        Ok(())
    }

    /// Drop an object and its key mapping.
    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<ObjectEntry> {
        let entry = self.objects.shift_remove(&id)?;
        self.by_key.remove(&entry.key);
        Some(entry)
    }

    /// Objects in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &ObjectEntry)> {
        self.objects.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

fn not_registered(id: ObjectId) -> Error {
    Error::state(
        StateErrorKind::NotRegistered,
        format!("object {id} is not registered in this session"),
    )
}
