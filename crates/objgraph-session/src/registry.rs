//! Process-wide session registry.
//!
//! Maps session ids to sessions sharing one [`SnapshotCache`]. The registry
//! lock only guards lookup, creation and removal; each session sits behind its
//! own mutex, so operations on different sessions run concurrently while
//! operations on the same session are serialized.

use crate::cache::{CacheConfig, SnapshotCache};
use crate::commit::CommitSummary;
use crate::object_store::ObjectId;
use crate::{SelectQuery, Session, SessionConfig, next_session_id};
use indexmap::IndexSet;
use objgraph_core::{
    Error, IdentityKey, QueryLayer, Result, Schema, SessionError, SessionErrorKind,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Configuration shared by every session of a registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub session: SessionConfig,
    pub cache: CacheConfig,
    /// How many recently closed ids are still reported as expired. Older ids
    /// are reported as unknown.
    pub closed_id_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            cache: CacheConfig::default(),
            closed_id_capacity: 1024,
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn closed_id_capacity(mut self, capacity: usize) -> Self {
        self.closed_id_capacity = capacity;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    ShutDown,
}

type SharedSession<Q> = Arc<Mutex<Session<Q>>>;

struct RegistryState<Q: QueryLayer> {
    lifecycle: Lifecycle,
    sessions: HashMap<u64, SharedSession<Q>>,
    /// Recently closed ids, oldest first.
    closed: IndexSet<u64>,
}

impl<Q: QueryLayer> RegistryState<Q> {
    fn remember_closed(&mut self, id: u64, capacity: usize) {
        self.closed.shift_remove(&id);
        self.closed.insert(id);
        while self.closed.len() > capacity {
            self.closed.shift_remove_index(0);
        }
    }
}

/// Owner of all sessions of one process (or one test).
///
/// Must be started with [`SessionRegistry::init`]; after
/// [`SessionRegistry::shutdown`] every call fails.
pub struct SessionRegistry<Q: QueryLayer + Clone> {
    schema: Arc<Schema>,
    query: Q,
    config: RegistryConfig,
    cache: Arc<SnapshotCache>,
    state: Mutex<RegistryState<Q>>,
}

impl<Q: QueryLayer + Clone> std::fmt::Debug for SessionRegistry<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SessionRegistry")
            .field("lifecycle", &state.lifecycle)
            .field("sessions", &state.sessions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<Q: QueryLayer + Clone> SessionRegistry<Q> {
    pub fn new(schema: Arc<Schema>, query: Q, config: RegistryConfig) -> Self {
        let cache = Arc::new(SnapshotCache::new(config.cache.clone()));
        Self {
            schema,
            query,
            config,
            cache,
            state: Mutex::new(RegistryState {
                lifecycle: Lifecycle::Created,
                sessions: HashMap::new(),
                closed: IndexSet::new(),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<Q>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start accepting sessions. Calling it again is a no-op.
    pub fn init(&self) -> Result<()> {
        let mut state = self.lock();
        match state.lifecycle {
            Lifecycle::ShutDown => Err(shut_down(None)),
            Lifecycle::Running => Ok(()),
            Lifecycle::Created => {
                state.lifecycle = Lifecycle::Running;
                info!("Session registry started");
                Ok(())
            }
        }
    }

    /// Close every session and stop accepting calls.
    ///
    /// Returns the number of sessions closed.
    pub fn shutdown(&self) -> usize {
        let sessions = {
            let mut state = self.lock();
            state.lifecycle = Lifecycle::ShutDown;
            let mut ids: Vec<u64> = state.sessions.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                state.remember_closed(id, self.config.closed_id_capacity);
            }
            std::mem::take(&mut state.sessions)
        };
        let closed = sessions.len();
        drop(sessions);
        self.cache.clear();
        info!(closed, "Session registry shut down");
        closed
    }

    pub fn is_running(&self) -> bool {
        self.lock().lifecycle == Lifecycle::Running
    }

    /// Open a session with a fresh id.
    pub fn new_session(&self) -> Result<u64> {
        let mut state = self.running()?;
        let mut id = next_session_id();
        while state.sessions.contains_key(&id) || state.closed.contains(&id) {
            id = next_session_id();
        }
        self.insert(&mut state, id);
        Ok(id)
    }

    /// Open a session under a caller-chosen id.
    pub fn open_session(&self, id: u64) -> Result<u64> {
        let mut state = self.running()?;
        if state.sessions.contains_key(&id) {
            return Err(Error::Session(SessionError {
                kind: SessionErrorKind::Duplicate,
                session_id: Some(id),
                message: "a session with this id is already open".to_string(),
            }));
        }
        state.closed.shift_remove(&id);
        self.insert(&mut state, id);
        Ok(id)
    }

    fn insert(&self, state: &mut RegistryState<Q>, id: u64) {
        let session = Session::with_id(
            id,
            Arc::clone(&self.schema),
            self.query.clone(),
            Arc::clone(&self.cache),
            self.config.session.clone(),
        );
        state.sessions.insert(id, Arc::new(Mutex::new(session)));
        debug!(session = id, open = state.sessions.len(), "Registered session");
    }

    /// Look up an open session.
    pub fn session(&self, id: u64) -> Result<SharedSession<Q>> {
        let state = self.running()?;
        match state.sessions.get(&id) {
            Some(session) => Ok(Arc::clone(session)),
            None => Err(missing(&state, id)),
        }
    }

    /// Close a session, dropping its objects and pending changes.
    pub fn close_session(&self, id: u64) -> Result<()> {
        let session = {
            let mut state = self.running()?;
            let Some(session) = state.sessions.remove(&id) else {
                return Err(missing(&state, id));
            };
            state.remember_closed(id, self.config.closed_id_capacity);
            session
        };
        drop(session);
        debug!(session = id, "Closed session");
        Ok(())
    }

    pub fn session_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    /// Run `f` with exclusive access to one session.
    pub fn with_session<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut Session<Q>) -> Result<R>,
    ) -> Result<R> {
        let session = self.session(id)?;
        let mut guard = session.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut *guard)
    }

    pub fn perform_query(&self, id: u64, query: &SelectQuery) -> Result<Vec<ObjectId>> {
        self.with_session(id, |session| session.perform_query(query))
    }

    pub fn commit_changes(&self, id: u64) -> Result<CommitSummary> {
        self.with_session(id, Session::commit_changes)
    }

    pub fn rollback_changes(&self, id: u64) -> Result<usize> {
        self.with_session(id, Session::rollback_changes)
    }

    pub fn create_fault(&self, id: u64, key: IdentityKey) -> Result<ObjectId> {
        self.with_session(id, |session| session.create_fault(key))
    }

    fn running(&self) -> Result<MutexGuard<'_, RegistryState<Q>>> {
        let state = self.lock();
        match state.lifecycle {
            Lifecycle::Running => Ok(state),
            Lifecycle::Created => Err(Error::Session(SessionError {
                kind: SessionErrorKind::RegistryShutDown,
                session_id: None,
                message: "session registry has not been initialized".to_string(),
            })),
            Lifecycle::ShutDown => Err(shut_down(None)),
        }
    }
}

fn shut_down(id: Option<u64>) -> Error {
    Error::Session(SessionError {
        kind: SessionErrorKind::RegistryShutDown,
        session_id: id,
        message: "session registry is shut down".to_string(),
    })
}

fn missing<Q: QueryLayer>(state: &RegistryState<Q>, id: u64) -> Error {
    let (kind, message) = if state.closed.contains(&id) {
        (SessionErrorKind::Expired, "session was closed")
    } else {
        (SessionErrorKind::Unknown, "no session with this id")
    };
    Error::Session(SessionError {
        kind,
        session_id: Some(id),
        message: message.to_string(),
    })
}
