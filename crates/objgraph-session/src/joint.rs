//! Joint prefetch resolution.
//!
//! Turns the flat rows of one joined query into a linked object graph. The
//! pass runs in two phases so that a failure leaves the session untouched:
//!
//! 1. [`extract`] walks every row depth-first over the prefetch tree and
//!    collects identities, snapshots and links without touching the store.
//! 2. [`Session::resolve_joint`] registers or refreshes the objects, resolves
//!    every relationship slot the rows spoke about, then links them.

use crate::Session;
use crate::fault::Fault;
use crate::object_store::ObjectId;
use crate::state::{LifecycleEvent, ObjectState};
use indexmap::{IndexMap, IndexSet};
use objgraph_core::{
    EntityDescriptor, Error, IdentityKey, QueryError, QueryErrorKind, QueryLayer,
    RelationshipDescriptor, Result, Row, RowSnapshot,
};
use objgraph_prefetch::{NodeId, PrefetchTree};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Everything one pass learned from its rows.
#[derive(Debug, Default)]
pub(crate) struct Extraction {
    /// First-seen snapshot per identity.
    pub objects: IndexMap<IdentityKey, (Arc<EntityDescriptor>, RowSnapshot)>,
    /// Root identities in first-seen order.
    pub roots: IndexSet<IdentityKey>,
    /// `(child node, parent key)`: the parent's slot for that node's
    /// relationship was present in the result, possibly empty.
    pub touched: IndexSet<(NodeId, IdentityKey)>,
    /// `(child node, parent key, child key)` in row order.
    pub links: IndexSet<(NodeId, IdentityKey, IdentityKey)>,
}

/// Collect identities, snapshots and links from joined rows.
///
/// Rows are processed strictly in order. A root row without a primary key
/// aborts the pass; a NULL key below the root means the outer join found
/// nothing there.
pub(crate) fn extract(tree: &PrefetchTree, rows: &[Row]) -> Result<Extraction> {
    let mut out = Extraction::default();
    let mut stack: Vec<(NodeId, Option<IdentityKey>)> = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        stack.push((NodeId::ROOT, None));
        while let Some((node_id, parent_key)) = stack.pop() {
            let node = tree.node(node_id);
            if let Some(parent_key) = &parent_key {
                out.touched.insert((node_id, parent_key.clone()));
            }

            let Some(key) = node.columns().identity_key(&node.entity().name, row) else {
                if node.is_root() {
                    return Err(Error::Query(
                        QueryError::new(
                            QueryErrorKind::Database,
                            format!("row {index} has no primary key for the query root"),
                        )
                        .with_entity(node.entity().name.clone()),
                    ));
                }
                trace!(row = index, path = node.path(), "No related row");
                continue;
            };

            if !out.objects.contains_key(&key) {
                out.objects.insert(
                    key.clone(),
                    (Arc::clone(node.entity()), node.columns().snapshot(row)),
                );
            }
            match parent_key {
                None => {
                    out.roots.insert(key.clone());
                }
                Some(parent_key) => {
                    out.links.insert((node_id, parent_key, key.clone()));
                }
            }

            let children: Vec<NodeId> = node.children().collect();
            for child in children.into_iter().rev() {
                stack.push((child, Some(key.clone())));
            }
        }
    }
    Ok(out)
}

impl<Q: QueryLayer> Session<Q> {
    /// Materialize the rows of a joined query into the store.
    ///
    /// Returns the root objects, deduplicated, in first-seen order.
    #[tracing::instrument(level = "debug", skip(self, tree, rows), fields(rows = rows.len()))]
    pub(crate) fn resolve_joint(
        &mut self,
        tree: &PrefetchTree,
        rows: &[Row],
    ) -> Result<Vec<ObjectId>> {
        let extraction = extract(tree, rows)?;
        let ids = self.materialize(extraction.objects)?;
        let id_of = |key: &IdentityKey| ids.get(key).copied();

        let mut resolved: HashSet<(ObjectId, String)> = HashSet::new();
        let mut filled: Vec<(ObjectId, RelationshipDescriptor)> = Vec::new();
        for (node_id, parent_key) in &extraction.touched {
            let Some(relationship) = tree.node(*node_id).incoming() else {
                continue;
            };
            let Some(parent) = id_of(parent_key) else {
                continue;
            };
            let entry = self.store.get_mut(parent)?;
            let replace = match entry.fault(&relationship.name) {
                None | Some(Fault::Unresolved) => true,
                Some(_) => self.config.refresh_on_fetch && entry.state() == ObjectState::Committed,
            };
            if replace {
                entry.set_fault(
                    &relationship.name,
                    Fault::resolved_empty(relationship.kind.is_to_many()),
                );
                resolved.insert((parent, relationship.name.clone()));
                filled.push((parent, relationship.clone()));
            }
        }

        let mut linked = 0_usize;
        for (node_id, parent_key, child_key) in &extraction.links {
            let Some(relationship) = tree.node(*node_id).incoming() else {
                continue;
            };
            let (Some(parent), Some(child)) = (id_of(parent_key), id_of(child_key)) else {
                continue;
            };
            if !resolved.contains(&(parent, relationship.name.clone())) {
                continue;
            }
            if self.store.get(child)?.state() == ObjectState::Deleted {
                continue;
            }
            if let Some(fault) = self.store.get_mut(parent)?.fault_mut(&relationship.name) {
                if fault.link(child) {
                    linked += 1;
                }
            }
        }

        for (parent, relationship) in &filled {
            self.overlay_pending_edits(*parent, relationship)?;
        }

        let roots: Vec<ObjectId> = extraction.roots.iter().filter_map(id_of).collect();
        debug!(
            roots = roots.len(),
            objects = ids.len(),
            slots = resolved.len(),
            links = linked,
            "Resolved joint prefetch"
        );
        Ok(roots)
    }

    /// Register fetched rows, loading HOLLOW objects and refreshing clean ones.
    ///
    /// Snapshots are staged; the caller publishes them once its pass succeeds.
    pub(crate) fn materialize(
        &mut self,
        objects: IndexMap<IdentityKey, (Arc<EntityDescriptor>, RowSnapshot)>,
    ) -> Result<HashMap<IdentityKey, ObjectId>> {
        let mut ids = HashMap::with_capacity(objects.len());
        let mut fetched = Vec::with_capacity(objects.len());

        for (key, (entity, snapshot)) in objects {
            let snapshot = Arc::new(snapshot);
            let (id, _) = self.store.register_hollow(key.clone(), entity)?;
            let entry = self.store.get_mut(id)?;
            match entry.state() {
                ObjectState::Hollow => {
                    entry.load(Arc::clone(&snapshot));
                    entry.transition(LifecycleEvent::Load)?;
                }
                ObjectState::Committed if self.config.refresh_on_fetch => {
                    entry.load(Arc::clone(&snapshot));
                }
                state => {
                    trace!(object = %id, state = %state, "Keeping local state over fetched row");
                }
            }
            fetched.push((key.clone(), snapshot));
            ids.insert(key, id);
        }

        self.staged.extend(fetched);
        Ok(ids)
    }
}
