//! Commit differencing.
//!
//! Compares each dirty object's current values with its committed snapshot
//! and describes the statement (if any) needed to persist it.

use crate::Session;
use crate::object_store::{ObjectEntry, ObjectId};
use crate::state::ObjectState;
use objgraph_core::{
    EntityDescriptor, IdentityKey, QueryLayer, Result, RowSnapshot, WriteKind, diff_snapshots,
};
use std::sync::Arc;

/// One pending statement.
#[derive(Debug, Clone)]
pub struct ObjectChange {
    pub id: ObjectId,
    pub kind: WriteKind,
    /// Identity qualifying the statement. Temporary for inserts.
    pub key: IdentityKey,
    pub entity: Arc<EntityDescriptor>,
    /// Full row for inserts, changed columns for updates, empty for deletes.
    pub values: RowSnapshot,
}

/// Values to persist for one object, or `None` when nothing needs writing.
pub fn diff_entry(entry: &ObjectEntry) -> Option<RowSnapshot> {
    match entry.state() {
        ObjectState::New => Some(entry.values().clone()),
        ObjectState::Modified | ObjectState::Committed => {
            let empty = RowSnapshot::new();
            let committed = entry.committed().map_or(&empty, |c| c.as_ref());
            diff_snapshots(committed, entry.values())
        }
        ObjectState::Transient | ObjectState::Hollow | ObjectState::Deleted => None,
    }
}

/// Statement needed for one object.
pub fn change_for(id: ObjectId, entry: &ObjectEntry) -> Option<ObjectChange> {
    let (kind, values) = match entry.state() {
        ObjectState::New => (WriteKind::Insert, entry.values().clone()),
        ObjectState::Modified => (WriteKind::Update, diff_entry(entry)?),
        ObjectState::Deleted if !entry.key().is_temporary() => {
            (WriteKind::Delete, RowSnapshot::new())
        }
        _ => return None,
    };
    Some(ObjectChange {
        id,
        kind,
        key: entry.key().clone(),
        entity: Arc::clone(entry.entity()),
        values,
    })
}

impl<Q: QueryLayer> Session<Q> {
    /// Columns that differ from the committed snapshot.
    ///
    /// NEW objects report their full row; DELETED and HOLLOW objects report nothing.
    pub fn diff(&self, id: ObjectId) -> Result<Option<RowSnapshot>> {
        Ok(diff_entry(self.store.get(id)?))
    }

    /// Every statement the next commit would run for tracked objects, in
    /// registration order.
    pub fn pending_changes(&self) -> Vec<ObjectChange> {
        self.store
            .iter()
            .filter_map(|(id, entry)| change_for(id, entry))
            .collect()
    }

    /// Whether the next commit has anything to do.
    pub fn has_changes(&self) -> bool {
        !self.link_ops.is_empty()
            || self
                .store
                .iter()
                .any(|(_, entry)| entry.state().is_dirty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::ObjectStore;
    use crate::state::LifecycleEvent;
    use objgraph_core::{Value, make_key};

    fn artist() -> Arc<EntityDescriptor> {
        Arc::new(EntityDescriptor::new("Artist", "ARTIST").attribute("artistName", "ARTIST_NAME"))
    }

    fn loaded(store: &mut ObjectStore, name: &str) -> ObjectId {
        let key = make_key("Artist", [("ARTIST_ID", 1_i64)]);
        let (id, _) = store.register_hollow(key, artist()).unwrap();
        let entry = store.get_mut(id).unwrap();
        entry.load(Arc::new(
            [("ARTIST_ID", Value::BigInt(1)), ("ARTIST_NAME", Value::from(name))]
                .into_iter()
                .collect(),
        ));
        entry.transition(LifecycleEvent::Load).unwrap();
        id
    }

    #[test]
    fn test_modified_object_reports_changed_columns() {
        let mut store = ObjectStore::new();
        let id = loaded(&mut store, "Gris");
        let entry = store.get_mut(id).unwrap();
        entry.values_mut().insert("ARTIST_NAME", "Juan Gris");
        entry.transition(LifecycleEvent::Write).unwrap();

        let change = change_for(id, store.get(id).unwrap()).unwrap();
        assert_eq!(change.kind, WriteKind::Update);
        assert_eq!(change.values.len(), 1);
        assert_eq!(change.values.get("ARTIST_NAME"), Some(&Value::from("Juan Gris")));
    }

    #[test]
    fn test_write_back_of_same_value_needs_no_statement() {
        let mut store = ObjectStore::new();
        let id = loaded(&mut store, "Gris");
        let entry = store.get_mut(id).unwrap();
        entry.values_mut().insert("ARTIST_NAME", "Gris");
        entry.transition(LifecycleEvent::Write).unwrap();

        assert!(diff_entry(store.get(id).unwrap()).is_none());
        assert!(change_for(id, store.get(id).unwrap()).is_none());
    }

    #[test]
    fn test_removed_column_is_cleared() {
        let mut store = ObjectStore::new();
        let id = loaded(&mut store, "Gris");
        let entry = store.get_mut(id).unwrap();
        entry.values_mut().remove("ARTIST_NAME");
        entry.transition(LifecycleEvent::Write).unwrap();

        let diff = diff_entry(store.get(id).unwrap()).unwrap();
        assert_eq!(diff.get("ARTIST_NAME"), Some(&Value::Null));
    }

    #[test]
    fn test_new_object_inserts_full_row() {
        let mut store = ObjectStore::new();
        let values: RowSnapshot = [("ARTIST_NAME", "Arp")].into_iter().collect();
        let id = store.register_new(artist(), values.clone()).unwrap();
        let change = change_for(id, store.get(id).unwrap()).unwrap();
        assert_eq!(change.kind, WriteKind::Insert);
        assert!(change.key.is_temporary());
        assert_eq!(change.values, values);
    }

    #[test]
    fn test_deleted_object_deletes_by_key_only() {
        let mut store = ObjectStore::new();
        let id = loaded(&mut store, "Gris");
        store
            .get_mut(id)
            .unwrap()
            .transition(LifecycleEvent::Delete)
            .unwrap();
        let entry = store.get(id).unwrap();
        assert!(diff_entry(entry).is_none());
        let change = change_for(id, entry).unwrap();
        assert_eq!(change.kind, WriteKind::Delete);
        assert!(change.values.is_empty());
        assert_eq!(change.key, make_key("Artist", [("ARTIST_ID", 1_i64)]));
    }
}
