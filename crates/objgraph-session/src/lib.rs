//! Sessions for objgraph.
//!
//! `objgraph-session` is the **unit-of-work layer**. A [`Session`] owns an
//! identity-mapped [`ObjectStore`], resolves relationship faults on demand,
//! materializes joint and disjoint prefetch results into a linked object
//! graph, and persists pending changes through the [`QueryLayer`]
//! collaborator.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one object per identity key per session.
//! - **Shared snapshots**: sessions share a [`SnapshotCache`] holding the last
//!   persisted state of every row, and learn about each other's commits through
//!   its batches.
//! - **Faults**: relationship slots start unresolved and fetch themselves on
//!   first access.
//!
//! # Design Philosophy
//!
//! - **Synchronous core**: every call may block on the query layer; nothing is
//!   scheduled behind the caller's back.
//! - **All-or-nothing**: a failed query, prefetch pass or commit leaves the
//!   session as it was.
//! - **Explicit ownership**: a session is `&mut` for every operation; sharing
//!   goes through the [`SessionRegistry`].
//!
//! # Example
//!
//! ```ignore
//! let cache = Arc::new(SnapshotCache::default());
//! let mut session = Session::new(schema, query_layer, cache, SessionConfig::default());
//!
//! let query = SelectQuery::new("Painting").prefetch("toArtist", PrefetchSemantics::Joint);
//! let paintings = session.perform_query(&query)?;
//! let artist = session.to_one(paintings[0], "toArtist")?;
//!
//! session.write(paintings[0], "paintingTitle", "Untitled")?;
//! session.commit_changes()?;
//! ```

pub mod cache;
pub mod commit;
pub mod differ;
mod disjoint;
pub mod fault;
pub mod fault_stats;
mod joint;
pub mod object_store;
mod relate;
pub mod registry;
pub mod state;

pub use cache::{
    CacheConfig, CacheStats, SnapshotBatch, SnapshotCache, SnapshotListener, SubscriptionId,
};
pub use commit::{CommitSummary, FlushOrderer, FlushPlan, LinkOp};
pub use differ::{ObjectChange, change_for, diff_entry};
pub use fault::Fault;
pub use fault_stats::{FaultStats, FaultSummary};
pub use object_store::{ObjectEntry, ObjectId, ObjectStore};
pub use registry::{RegistryConfig, SessionRegistry};
pub use state::{LifecycleEvent, ObjectState};

use objgraph_core::{
    ColumnPath, EntityDescriptor, Error, FaultError, IdentityKey, QueryLayer, Qualifier,
    RelationshipDescriptor, Result, RowSnapshot, SchemaErrorKind, Schema, StateErrorKind, Value,
    with_query_context,
};
use objgraph_prefetch::{NodeColumns, PhantomPolicy, PrefetchConfig, PrefetchTree, RelationshipPath};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Prefetch routing and phantom policy.
    pub prefetch: PrefetchConfig,
    /// Whether fetched rows overwrite COMMITTED objects (and re-resolve their
    /// relationship slots). Dirty objects are never overwritten.
    pub refresh_on_fetch: bool,
    /// Warn once a single relationship has fired this many faults.
    pub fault_warn_threshold: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefetch: PrefetchConfig::default(),
            refresh_on_fetch: true,
            fault_warn_threshold: Some(3),
        }
    }
}

impl SessionConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the prefetch config (builder pattern).
    #[must_use]
    pub fn prefetch(mut self, prefetch: PrefetchConfig) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the `refresh_on_fetch` option (builder pattern).
    #[must_use]
    pub fn refresh_on_fetch(mut self, value: bool) -> Self {
        self.refresh_on_fetch = value;
        self
    }

    /// Set or clear the fault warning threshold (builder pattern).
    #[must_use]
    pub fn fault_warn_threshold(mut self, threshold: Option<usize>) -> Self {
        self.fault_warn_threshold = threshold;
        self
    }
}

// ============================================================================
// Select Queries
// ============================================================================

/// How one prefetch path is fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrefetchSemantics {
    /// Outer-joined into the main query.
    #[default]
    Joint,
    /// One extra query per relationship, keyed by the parents already fetched.
    Disjoint,
    /// Disjoint when the path crosses more than one to-many relationship and
    /// automatic routing is enabled, joint otherwise.
    Auto,
}

/// A root-entity query with prefetch paths.
#[derive(Debug, Clone)]
pub struct SelectQuery {
    entity: String,
    qualifier: Qualifier,
    prefetches: Vec<(String, PrefetchSemantics)>,
}

impl SelectQuery {
    /// Select every row of `entity`.
    #[must_use]
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            qualifier: Qualifier::All,
            prefetches: Vec::new(),
        }
    }

    /// Restrict the root rows.
    #[must_use]
    pub fn qualifier(mut self, qualifier: Qualifier) -> Self {
        self.qualifier = qualifier;
        self
    }

    /// Prefetch a dot-separated relationship path.
    #[must_use]
    pub fn prefetch(mut self, path: impl Into<String>, semantics: PrefetchSemantics) -> Self {
        self.prefetches.push((path.into(), semantics));
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn qualifier_ref(&self) -> &Qualifier {
        &self.qualifier
    }

    pub fn prefetches(&self) -> &[(String, PrefetchSemantics)] {
        &self.prefetches
    }
}

// ============================================================================
// Session
// ============================================================================

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique session id.
pub(crate) fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A unit of work over a shared snapshot cache.
///
/// The session owns its objects exclusively. Every public operation first
/// applies the batches other sessions committed to the shared cache since the
/// last call.
pub struct Session<Q: QueryLayer> {
    id: u64,
    schema: Arc<Schema>,
    query: Q,
    cache: Arc<SnapshotCache>,
    config: SessionConfig,
    store: ObjectStore,
    /// Pending flattened relationship edits, flushed as link-table rows.
    link_ops: Vec<LinkOp>,
    fault_stats: FaultStats,
    /// Snapshots fetched by the running pass, published once it succeeds.
    staged: Vec<(IdentityKey, Arc<RowSnapshot>)>,
    subscription: SubscriptionId,
    events: Receiver<Arc<SnapshotBatch>>,
}

impl<Q: QueryLayer> std::fmt::Debug for Session<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("objects", &self.store.len())
            .field("link_ops", &self.link_ops.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<Q: QueryLayer> Session<Q> {
    /// Create a session with a fresh id.
    pub fn new(
        schema: Arc<Schema>,
        query: Q,
        cache: Arc<SnapshotCache>,
        config: SessionConfig,
    ) -> Self {
        Self::with_id(next_session_id(), schema, query, cache, config)
    }

    /// Create a session with a caller-chosen id.
    pub fn with_id(
        id: u64,
        schema: Arc<Schema>,
        query: Q,
        cache: Arc<SnapshotCache>,
        config: SessionConfig,
    ) -> Self {
        let (subscription, events) = cache.subscribe_channel();
        debug!(session = id, "Opened session");
        Self {
            id,
            schema,
            query,
            fault_stats: FaultStats::new(config.fault_warn_threshold),
            cache,
            config,
            store: ObjectStore::new(),
            link_ops: Vec::new(),
            staged: Vec::new(),
            subscription,
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn query_layer(&self) -> &Q {
        &self.query
    }

    /// Fault firing counts, for N+1 detection.
    pub fn fault_stats(&self) -> &FaultStats {
        &self.fault_stats
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Every tracked object in registration order.
    pub fn all_objects(&self) -> impl Iterator<Item = (ObjectId, &ObjectEntry)> {
        self.store.iter()
    }

    pub fn object(&self, id: ObjectId) -> Result<&ObjectEntry> {
        self.store.get(id)
    }

    pub fn state(&self, id: ObjectId) -> Result<ObjectState> {
        Ok(self.store.get(id)?.state())
    }

    /// Handle of the object registered under `key`, if any.
    pub fn lookup(&self, key: &IdentityKey) -> Option<ObjectId> {
        self.store.lookup(key)
    }

    /// Pending link-table edits.
    pub fn link_ops(&self) -> &[LinkOp] {
        &self.link_ops
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Return the object for `key`, registering it HOLLOW if unknown.
    pub fn create_fault(&mut self, key: IdentityKey) -> Result<ObjectId> {
        self.sync_peers();
        self.register_hollow(key)
    }

    pub(crate) fn register_hollow(&mut self, key: IdentityKey) -> Result<ObjectId> {
        if key.is_temporary() || key.has_null() {
            return Err(Error::state(
                StateErrorKind::IllegalTransition,
                format!("cannot register {key}: identity is incomplete"),
            ));
        }
        let entity = Arc::clone(self.schema.entity(key.entity())?);
        for column in key.values().keys() {
            if !entity.is_primary_key(column) {
                return Err(Error::schema(
                    SchemaErrorKind::UnknownColumn,
                    format!("{column} is not a primary key column of {}", entity.name),
                ));
            }
        }
        let (id, created) = self.store.register_hollow(key, entity)?;
        if created {
            trace!(object = %id, "Registered hollow object");
        }
        Ok(id)
    }

    /// Register a NEW object. `values` may name attributes or columns.
    #[tracing::instrument(level = "trace", skip(self, values))]
    pub fn register_new<I, K, V>(&mut self, entity: &str, values: I) -> Result<ObjectId>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.sync_peers();
        let entity = Arc::clone(self.schema.entity(entity)?);
        let mut snapshot = RowSnapshot::new();
        for (name, value) in values {
            let column = column_name(&entity, name.as_ref())?;
            snapshot.insert(column, value.into());
        }
        self.store.register_new(entity, snapshot)
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load a HOLLOW object. A no-op for any other state.
    pub fn resolve(&mut self, id: ObjectId) -> Result<()> {
        if self.store.get(id)?.state() != ObjectState::Hollow {
            return Ok(());
        }
        self.load_hollow(&[id])
    }

    /// Load HOLLOW objects from the shared cache, fetching the rest in one
    /// query per entity.
    ///
    /// Fails without loading anything fetched if any row is missing.
    pub(crate) fn load_hollow(&mut self, ids: &[ObjectId]) -> Result<()> {
        let mut pending: Vec<(ObjectId, IdentityKey, Arc<EntityDescriptor>)> = Vec::new();
        for &id in ids {
            let entry = self.store.get(id)?;
            if entry.state() != ObjectState::Hollow {
                continue;
            }
            let key = entry.key().clone();
            let entity = Arc::clone(entry.entity());
            if let Some(snapshot) = self.cache.get(&key) {
                let entry = self.store.get_mut(id)?;
                entry.load(snapshot);
                entry.transition(LifecycleEvent::Load)?;
                trace!(object = %id, "Loaded from snapshot cache");
                continue;
            }
            if !pending.iter().any(|(other, _, _)| *other == id) {
                pending.push((id, key, entity));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let mut by_entity: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, (_, key, _)) in pending.iter().enumerate() {
            by_entity.entry(key.entity().to_string()).or_default().push(index);
        }

        let mut fetched: HashMap<IdentityKey, Arc<RowSnapshot>> = HashMap::new();
        for indexes in by_entity.values() {
            let entity = Arc::clone(&pending[indexes[0]].2);
            let qualifier = if let [only] = indexes.as_slice() {
                Qualifier::for_key(&pending[*only].1)
            } else {
                Qualifier::KeyIn {
                    columns: entity
                        .primary_key()
                        .iter()
                        .map(|c| ColumnPath::new(c.clone()))
                        .collect(),
                    keys: indexes
                        .iter()
                        .map(|i| {
                            let key = &pending[*i].1;
                            entity
                                .primary_key()
                                .iter()
                                .map(|c| key.value(c).cloned().unwrap_or(Value::Null))
                                .collect()
                        })
                        .collect(),
                }
            };
            let rows = self
                .query
                .execute_query(&entity, &qualifier)
                .map_err(|e| with_query_context(e, &entity.name, None, None))?;
            let plan = NodeColumns::for_root(&entity);
            for row in &rows {
                if let Some(key) = plan.identity_key(&entity.name, row) {
                    fetched
                        .entry(key)
                        .or_insert_with(|| Arc::new(plan.snapshot(row)));
                }
            }
        }

        let missing = pending.iter().find(|(_, key, _)| !fetched.contains_key(key));
        if let Some((id, key, entity)) = missing {
            warn!(object = %id, key = %key, "Stale reference: row no longer exists");
            return Err(Error::FaultResolution(FaultError {
                entity: entity.name.clone(),
                key: key.to_string(),
                message: "no row exists for this identity".to_string(),
            }));
        }

        for (id, key, _) in &pending {
            if let Some(snapshot) = fetched.get(key) {
                let entry = self.store.get_mut(*id)?;
                entry.load(Arc::clone(snapshot));
                entry.transition(LifecycleEvent::Load)?;
            }
        }
        debug!(objects = pending.len(), "Resolved hollow objects");
        self.cache.put_all(fetched);
        Ok(())
    }

    /// Run a query and materialize its rows and prefetches.
    ///
    /// Returns the root objects in first-seen order. Prefetch paths are
    /// validated before any query runs.
    #[tracing::instrument(
        level = "debug",
        skip(self, query),
        fields(session = self.id, entity = %query.entity)
    )]
    pub fn perform_query(&mut self, query: &SelectQuery) -> Result<Vec<ObjectId>> {
        self.sync_peers();
        let entity = Arc::clone(self.schema.entity(&query.entity)?);

        let mut joint: Vec<&str> = Vec::new();
        let mut disjoint: Vec<&str> = Vec::new();
        for (path, semantics) in &query.prefetches {
            let use_disjoint = match semantics {
                PrefetchSemantics::Joint => false,
                PrefetchSemantics::Disjoint => true,
                PrefetchSemantics::Auto => {
                    self.config.prefetch.auto_disjoint
                        && self.to_many_hops(&entity.name, path)? > 1
                }
            };
            if use_disjoint {
                disjoint.push(path);
            } else {
                joint.push(path);
            }
        }

        let joint_tree = PrefetchTree::build(
            &self.schema,
            &entity.name,
            &joint,
            &query.qualifier,
            self.config.prefetch.phantom_policy,
        )?;
        let disjoint_tree = PrefetchTree::build(
            &self.schema,
            &entity.name,
            &disjoint,
            &Qualifier::All,
            PhantomPolicy::None,
        )?;

        let fetched = if joint_tree.is_empty() {
            self.query.execute_query(&entity, &query.qualifier)
        } else {
            self.query
                .execute_joined_query(&entity, &joint_tree.joined_select(), &query.qualifier)
        };
        let rows = fetched.map_err(|e| with_query_context(e, &entity.name, None, None))?;

        // Disjoint queries run after the roots are materialized.
        let checkpoint = (!disjoint_tree.is_empty()).then(|| self.store.clone());
        let resolved = self.resolve_joint(&joint_tree, &rows).and_then(|roots| {
            if !disjoint_tree.is_empty() {
                self.resolve_disjoint(&disjoint_tree, &roots)?;
            }
            Ok(roots)
        });
        let roots = match resolved {
            Ok(roots) => roots,
            Err(err) => {
                self.staged.clear();
                if let Some(store) = checkpoint {
                    self.store = store;
                }
                warn!(error = %err, "Query pass failed; session left unchanged");
                return Err(err);
            }
        };
        self.publish_staged();
        debug!(rows = rows.len(), roots = roots.len(), "Query complete");
        Ok(roots)
    }

    /// Hand the snapshots of a successful pass to the shared cache.
    pub(crate) fn publish_staged(&mut self) {
        if !self.staged.is_empty() {
            self.cache.put_all(std::mem::take(&mut self.staged));
        }
    }

    fn to_many_hops(&self, root: &str, path: &str) -> Result<usize> {
        let parsed = RelationshipPath::parse(root, path)?;
        Ok(parsed
            .resolve(&self.schema, root)?
            .iter()
            .filter(|r| r.kind.is_to_many())
            .count())
    }

    // ========================================================================
    // Attribute Access
    // ========================================================================

    /// Read an attribute (or column), loading a HOLLOW object first.
    pub fn read(&mut self, id: ObjectId, attribute: &str) -> Result<Value> {
        self.sync_peers();
        let column = column_name(self.store.get(id)?.entity(), attribute)?;
        self.resolve(id)?;
        Ok(self.store.get(id)?.value(&column).clone())
    }

    /// Write an attribute (or column). Alias of [`Session::mark_modified`].
    pub fn write(&mut self, id: ObjectId, attribute: &str, value: impl Into<Value>) -> Result<()> {
        self.mark_modified(id, attribute, value)
    }

    /// Write through to the object; COMMITTED objects become MODIFIED.
    ///
    /// Primary keys of persisted objects are immutable.
    #[tracing::instrument(level = "trace", skip(self, value))]
    pub fn mark_modified(
        &mut self,
        id: ObjectId,
        attribute: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.sync_peers();
        let entry = self.store.get(id)?;
        let column = column_name(entry.entity(), attribute)?;
        if entry.state() == ObjectState::Deleted {
            return Err(Error::state(
                StateErrorKind::IllegalTransition,
                format!("cannot write {attribute} of DELETED object {id}"),
            ));
        }
        if entry.state() != ObjectState::New && entry.entity().is_primary_key(&column) {
            return Err(Error::state(
                StateErrorKind::IllegalTransition,
                format!("primary key column {column} of {id} cannot change"),
            ));
        }
        self.resolve(id)?;
        let entry = self.store.get_mut(id)?;
        entry.transition(LifecycleEvent::Write)?;
        entry.values_mut().insert(column, value.into());
        Ok(())
    }

    /// Mark an object for deletion. NEW objects are simply forgotten.
    pub fn mark_deleted(&mut self, id: ObjectId) -> Result<()> {
        self.sync_peers();
        let entry = self.store.get_mut(id)?;
        if entry.state() == ObjectState::New {
            entry.transition(LifecycleEvent::Evict)?;
            self.store.remove(id);
        } else {
            entry.transition(LifecycleEvent::Delete)?;
        }
        self.link_ops.retain(|op| !op.involves(id));
        self.unlink_everywhere(id);
        trace!(object = %id, "Marked deleted");
        Ok(())
    }

    // ========================================================================
    // Rollback and Expiry
    // ========================================================================

    /// Discard every uncommitted change.
    ///
    /// MODIFIED objects revert to their committed snapshot, NEW objects are
    /// dropped and DELETED objects are restored. Resolved relationships are
    /// forgotten when anything was reverted, since edits may have touched them.
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.id))]
    pub fn rollback_changes(&mut self) -> Result<usize> {
        self.sync_peers();
        let dirty: Vec<(ObjectId, ObjectState)> = self
            .store
            .iter()
            .filter(|(_, entry)| entry.state().is_dirty())
            .map(|(id, entry)| (id, entry.state()))
            .collect();

        for (id, state) in &dirty {
            if *state == ObjectState::New {
                self.store.remove(*id);
                continue;
            }
            let entry = self.store.get_mut(*id)?;
            let committed = entry.committed().cloned();
            entry.transition(LifecycleEvent::Revert {
                loaded: committed.is_some(),
            })?;
            match committed {
                Some(snapshot) => entry.load(snapshot),
                None => entry.unload(),
            }
        }

        let reverted = dirty.len();
        if reverted > 0 || !self.link_ops.is_empty() {
            for id in self.store.ids() {
                self.store.get_mut(id)?.reset_faults();
            }
        }
        self.link_ops.clear();
        info!(reverted, "Rolled back session");
        Ok(reverted)
    }

    /// Turn a COMMITTED object back into HOLLOW and forget its relationships.
    pub fn expire(&mut self, id: ObjectId) -> Result<()> {
        self.sync_peers();
        let entry = self.store.get_mut(id)?;
        entry.transition(LifecycleEvent::Expire)?;
        entry.unload();
        entry.reset_faults();
        Ok(())
    }

    /// Expire every clean object. Dirty objects are left alone.
    pub fn expire_all(&mut self) -> Result<usize> {
        self.sync_peers();
        let mut expired = 0;
        for id in self.store.ids() {
            let entry = self.store.get_mut(id)?;
            if matches!(entry.state(), ObjectState::Committed | ObjectState::Hollow) {
                entry.transition(LifecycleEvent::Expire)?;
                entry.unload();
                entry.reset_faults();
                expired += 1;
            }
        }
        debug!(expired, "Expired session objects");
        Ok(expired)
    }

    // ========================================================================
    // Peer Synchronisation
    // ========================================================================

    /// Apply batches committed by other sessions since the last call.
    pub(crate) fn sync_peers(&mut self) {
        let batches: Vec<Arc<SnapshotBatch>> = self.events.try_iter().collect();
        for batch in batches {
            if batch.source == Some(self.id) {
                continue;
            }
            self.apply_peer_batch(&batch);
        }
    }

    fn apply_peer_batch(&mut self, batch: &SnapshotBatch) {
        let mut refreshed = 0_usize;
        for (key, snapshot) in &batch.inserted {
            let Some(id) = self.store.lookup(key) else {
                continue;
            };
            let Ok(entry) = self.store.get_mut(id) else {
                continue;
            };
            match entry.state() {
                ObjectState::Committed => {
                    entry.load(Arc::new(snapshot.clone()));
                    refreshed += 1;
                }
                ObjectState::Modified => {
                    let empty = RowSnapshot::new();
                    let committed = entry.committed().map_or(&empty, |c| c.as_ref());
                    if let Some(diff) = objgraph_core::diff_snapshots(committed, snapshot) {
                        merge_peer_diff(entry, &diff);
                        refreshed += 1;
                    }
                }
                _ => {}
            }
        }

        for (key, diff) in &batch.modified {
            let Some(id) = self.store.lookup(key) else {
                continue;
            };
            let Ok(entry) = self.store.get_mut(id) else {
                continue;
            };
            match entry.state() {
                ObjectState::Committed => {
                    let mut snapshot = entry.values().clone();
                    snapshot.apply_diff(diff);
                    entry.load(Arc::new(snapshot));
                    refreshed += 1;
                }
                ObjectState::Modified => {
                    merge_peer_diff(entry, diff);
                    refreshed += 1;
                }
                _ => {}
            }
        }

        let mut evicted = 0_usize;
        for key in &batch.deleted {
            let Some(id) = self.store.lookup(key) else {
                continue;
            };
            if let Some(entry) = self.store.remove(id) {
                if entry.state() == ObjectState::Modified {
                    warn!(
                        object = %id,
                        key = %key,
                        "Deleted by another session; local changes dropped"
                    );
                }
            }
            self.link_ops.retain(|op| !op.involves(id));
            self.unlink_everywhere(id);
            evicted += 1;
        }

        if refreshed + evicted > 0 {
            debug!(
                session = self.id,
                source = ?batch.source,
                refreshed,
                evicted,
                "Applied peer batch"
            );
        }
    }

    /// The relationship `name` of the object's entity.
    pub(crate) fn relationship_of(
        &self,
        id: ObjectId,
        name: &str,
    ) -> Result<RelationshipDescriptor> {
        let entity = self.store.get(id)?.entity();
        entity.find_relationship(name).cloned().ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownRelationship,
                format!("entity '{}' has no relationship '{}'", entity.name, name),
            )
        })
    }
}

impl<Q: QueryLayer> Drop for Session<Q> {
    fn drop(&mut self) {
        self.cache.unsubscribe(self.subscription);
        debug!(session = self.id, "Closed session");
    }
}

/// Apply a peer's change to a MODIFIED object: the committed snapshot takes
/// the new values, and so do columns the session has not changed itself.
fn merge_peer_diff(entry: &mut ObjectEntry, diff: &RowSnapshot) {
    let mut committed = entry.committed().map(|c| (**c).clone()).unwrap_or_default();
    for (column, value) in diff.iter() {
        let untouched = entry.value(column).same_as(committed.get_or_null(column));
        if untouched {
            entry.values_mut().insert(column, value.clone());
        }
    }
    committed.apply_diff(diff);
    entry.set_committed(Some(Arc::new(committed)));
}

/// Column behind an attribute name, or the name itself if it is a column.
fn column_name(entity: &EntityDescriptor, name: &str) -> Result<String> {
    if let Some(column) = entity.column_for(name) {
        return Ok(column.to_string());
    }
    if entity.columns().iter().any(|c| c == name) {
        return Ok(name.to_string());
    }
    Err(Error::schema(
        SchemaErrorKind::UnknownColumn,
        format!("entity '{}' has no attribute or column '{}'", entity.name, name),
    ))
}
