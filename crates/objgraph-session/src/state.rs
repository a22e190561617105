//! Object lifecycle states and their transition function.

use objgraph_core::{Error, Result, StateErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectState {
    /// Not registered with any session.
    Transient,
    /// Registered, not yet persisted. Has no committed snapshot.
    New,
    /// Identity known, attributes not loaded.
    Hollow,
    /// Loaded and equal to the committed snapshot.
    Committed,
    /// Loaded and diverging from the committed snapshot.
    Modified,
    /// Marked for removal. Never faulted again.
    Deleted,
}

/// Something that happens to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Registered as a newly created object.
    RegisterNew,
    /// Registered by identity only.
    RegisterHollow,
    /// Row data applied from a fetch, a prefetch or the snapshot cache.
    Load,
    /// A tracked attribute was written.
    Write,
    /// Deletion requested.
    Delete,
    /// Pending changes were persisted.
    Commit,
    /// Loaded data discarded; the next access faults again.
    Expire,
    /// Uncommitted changes discarded. `loaded` tells whether a committed
    /// snapshot is available to revert to.
    Revert { loaded: bool },
    /// Dropped from the session.
    Evict,
}

impl LifecycleEvent {
    const fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::RegisterNew => "register as new",
            LifecycleEvent::RegisterHollow => "register as hollow",
            LifecycleEvent::Load => "load",
            LifecycleEvent::Write => "write",
            LifecycleEvent::Delete => "delete",
            LifecycleEvent::Commit => "commit",
            LifecycleEvent::Expire => "expire",
            LifecycleEvent::Revert { .. } => "revert",
            LifecycleEvent::Evict => "evict",
        }
    }
}

impl ObjectState {
    /// Apply an event, returning the next state.
    pub fn on(self, event: LifecycleEvent) -> Result<ObjectState> {
        use LifecycleEvent as E;
        use ObjectState as S;

        let next = match (self, event) {
            (_, E::Evict) => S::Transient,
            (S::Transient, E::RegisterNew) => S::New,
            (S::Transient, E::RegisterHollow) => S::Hollow,

            (S::Hollow | S::Committed, E::Load) => S::Committed,
            (S::Modified, E::Load) => S::Modified,

            (S::Committed | S::Modified, E::Write) => S::Modified,
            (S::New, E::Write) => S::New,

            (S::New | S::Hollow | S::Committed | S::Modified | S::Deleted, E::Delete) => S::Deleted,

            (S::New | S::Committed | S::Modified, E::Commit) => S::Committed,
            (S::Hollow, E::Commit) => S::Hollow,

            (S::Hollow | S::Committed, E::Expire) => S::Hollow,

            (S::New, E::Revert { .. }) => S::Transient,
            (S::Modified, E::Revert { .. }) => S::Committed,
            (S::Deleted, E::Revert { loaded: true }) => S::Committed,
            (S::Deleted, E::Revert { loaded: false }) => S::Hollow,
            (S::Hollow | S::Committed, E::Revert { .. }) => self,

            (state, event) => {
                return Err(Error::state(
                    StateErrorKind::IllegalTransition,
                    format!("cannot {} a {} object", event.as_str(), state),
                ));
            }
        };
        Ok(next)
    }

    /// Attribute values are present in memory.
    pub fn is_loaded(self) -> bool {
        matches!(self, ObjectState::New | ObjectState::Committed | ObjectState::Modified)
    }

    /// Commit has work to do for this object.
    pub fn is_dirty(self) -> bool {
        matches!(self, ObjectState::New | ObjectState::Modified | ObjectState::Deleted)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ObjectState::Transient => "TRANSIENT",
            ObjectState::New => "NEW",
            ObjectState::Hollow => "HOLLOW",
            ObjectState::Committed => "COMMITTED",
            ObjectState::Modified => "MODIFIED",
            ObjectState::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
