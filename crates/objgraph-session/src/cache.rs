//! Shared snapshot cache.
//!
//! Holds the last persisted state of every row any session has seen, keyed by
//! identity. Sessions share one cache: lookups take a read lock and never
//! block each other, while every mutation (including a whole commit batch)
//! runs under the write lock.
//!
//! After a batch is applied, subscribed listeners receive it as an immutable
//! [`SnapshotBatch`]. Peer sessions subscribe through a channel and apply the
//! batch to their own objects the next time they are used.

use indexmap::{IndexMap, IndexSet};
use objgraph_core::{IdentityKey, RowSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, trace};

/// Cache sizing.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Upper bound on cached snapshots. Least-recently-used entries are
    /// evicted past it. `None` means unbounded.
    pub max_snapshots: Option<usize>,
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_snapshots(mut self, max: usize) -> Self {
        self.max_snapshots = Some(max);
        self
    }
}

/// Changes produced by one successful write batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotBatch {
    /// Session that produced the batch, if any.
    pub source: Option<u64>,
    /// Changed columns of updated rows.
    pub modified: IndexMap<IdentityKey, RowSnapshot>,
    /// Full snapshots of inserted or refreshed rows.
    pub inserted: IndexMap<IdentityKey, RowSnapshot>,
    pub deleted: IndexSet<IdentityKey>,
}

impl SnapshotBatch {
    pub fn new(source: Option<u64>) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.inserted.is_empty() && self.deleted.is_empty()
    }

    /// Number of rows the batch touches.
    pub fn len(&self) -> usize {
        self.modified.len() + self.inserted.len() + self.deleted.len()
    }
}

/// Receives every applied batch.
pub trait SnapshotListener: Send + Sync {
    /// Handle a batch. Returning false unsubscribes the listener.
    fn on_batch(&self, batch: &Arc<SnapshotBatch>) -> bool;
}

impl<F> SnapshotListener for F
where
    F: Fn(&Arc<SnapshotBatch>) -> bool + Send + Sync,
{
    fn on_batch(&self, batch: &Arc<SnapshotBatch>) -> bool {
        self(batch)
    }
}

struct ChannelListener(Sender<Arc<SnapshotBatch>>);

impl SnapshotListener for ChannelListener {
    fn on_batch(&self, batch: &Arc<SnapshotBatch>) -> bool {
        self.0.send(Arc::clone(batch)).is_ok()
    }
}

/// Handle returned by [`SnapshotCache::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct CachedSnapshot {
    snapshot: Arc<RowSnapshot>,
    last_used: AtomicU64,
}

/// Committed row snapshots shared by every session of a registry.
pub struct SnapshotCache {
    entries: RwLock<HashMap<IdentityKey, CachedSnapshot>>,
    listeners: Mutex<Vec<(SubscriptionId, Box<dyn SnapshotListener>)>>,
    config: CacheConfig,
    clock: AtomicU64,
    next_subscription: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl SnapshotCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            config,
            clock: AtomicU64::new(0),
            next_subscription: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Cached committed state of a row.
    pub fn get(&self, key: &IdentityKey) -> Option<Arc<RowSnapshot>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) => {
                entry.last_used.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.snapshot))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Store a snapshot, replacing any previous one.
    pub fn put(&self, key: IdentityKey, snapshot: Arc<RowSnapshot>) {
        self.put_all(std::iter::once((key, snapshot)));
    }

    /// Store several snapshots under one lock.
    pub fn put_all(&self, snapshots: impl IntoIterator<Item = (IdentityKey, Arc<RowSnapshot>)>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for (key, snapshot) in snapshots {
            self.insert_locked(&mut entries, key, snapshot);
        }
        self.evict_locked(&mut entries);
    }

    /// Merge changed columns into a cached snapshot.
    ///
    /// Returns false when the row is not cached.
    pub fn apply_diff(&self, key: &IdentityKey, diff: &RowSnapshot) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Self::apply_diff_locked(&mut entries, key, diff)
    }

    pub fn remove(&self, key: &IdentityKey) -> bool {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Apply a whole write batch atomically and notify listeners.
    ///
    /// Listeners see batches in the order they were applied.
    #[tracing::instrument(level = "debug", skip(self, batch), fields(rows = batch.len()))]
    pub fn apply_batch(&self, batch: SnapshotBatch) -> Arc<SnapshotBatch> {
        let batch = Arc::new(batch);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for (key, diff) in &batch.modified {
            if !Self::apply_diff_locked(&mut entries, key, diff) {
                trace!(key = %key, "Modified row not cached; skipping diff");
            }
        }
        for (key, snapshot) in &batch.inserted {
            self.insert_locked(&mut entries, key.clone(), Arc::new(snapshot.clone()));
        }
        for key in &batch.deleted {
            entries.remove(key);
        }
        self.evict_locked(&mut entries);

        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        drop(entries);
        let before = listeners.len();
        listeners.retain(|(_, listener)| listener.on_batch(&batch));
        debug!(
            modified = batch.modified.len(),
            inserted = batch.inserted.len(),
            deleted = batch.deleted.len(),
            listeners = listeners.len(),
            dropped = before - listeners.len(),
            "Applied snapshot batch"
        );
        batch
    }

    /// Register a listener for applied batches.
    pub fn subscribe(&self, listener: Box<dyn SnapshotListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    /// Subscribe through a channel. The subscription ends when the receiver is dropped.
    pub fn subscribe_channel(&self) -> (SubscriptionId, Receiver<Arc<SnapshotBatch>>) {
        let (tx, rx) = mpsc::channel();
        (self.subscribe(Box::new(ChannelListener(tx))), rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn insert_locked(
        &self,
        entries: &mut HashMap<IdentityKey, CachedSnapshot>,
        key: IdentityKey,
        snapshot: Arc<RowSnapshot>,
    ) {
        entries.insert(
            key,
            CachedSnapshot {
                snapshot,
                last_used: AtomicU64::new(self.tick()),
            },
        );
    }

    fn apply_diff_locked(
        entries: &mut HashMap<IdentityKey, CachedSnapshot>,
        key: &IdentityKey,
        diff: &RowSnapshot,
    ) -> bool {
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        let mut merged = (*entry.snapshot).clone();
        merged.apply_diff(diff);
        entry.snapshot = Arc::new(merged);
        true
    }

    fn evict_locked(&self, entries: &mut HashMap<IdentityKey, CachedSnapshot>) {
        let Some(max) = self.config.max_snapshots else {
            return;
        };
        while entries.len() > max {
            let lru = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(key, _)| key.clone());
            let Some(key) = lru else {
                break;
            };
            trace!(key = %key, "Evicting snapshot");
            entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}
