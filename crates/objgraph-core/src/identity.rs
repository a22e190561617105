//! Identity keys naming persisted entity instances.
//!
//! An [`IdentityKey`] is the entity name plus the primary-key column values of
//! one row. Equality and hashing are structural, so keys can be used directly
//! as map keys by the snapshot cache and the per-session identity map.
//!
//! Objects that were created in memory and never persisted carry a
//! *temporary* key: a placeholder that is unique within the process and is
//! replaced by a permanent key once the row has been inserted.

use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TEMPORARY_ID: AtomicU64 = AtomicU64::new(1);

/// Canonical value naming one persisted (or about to be persisted) row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityKey {
    entity: String,
    values: IndexMap<String, Value>,
    temporary: Option<u64>,
}

impl IdentityKey {
    /// Create a permanent key from primary-key column values.
    pub fn new<I, K, V>(entity: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            entity: entity.into(),
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            temporary: None,
        }
    }

    /// Create a locally unique placeholder key for a not-yet-persisted object.
    pub fn temporary(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            values: IndexMap::new(),
            temporary: Some(NEXT_TEMPORARY_ID.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// The entity this key belongs to.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Primary-key column values (empty for temporary keys).
    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    /// Look up one primary-key column value.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Whether this is a placeholder for an object that has no row yet.
    pub fn is_temporary(&self) -> bool {
        self.temporary.is_some()
    }

    /// Whether any key column is NULL (such a key names no row).
    pub fn has_null(&self) -> bool {
        self.values.values().any(Value::is_null)
    }
}

/// Build an identity key. Pure and total.
pub fn make_key<I, K, V>(entity: impl Into<String>, values: I) -> IdentityKey
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    IdentityKey::new(entity, values)
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.temporary == other.temporary
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .all(|(k, v)| other.values.get(k).is_some_and(|o| v.same_as(o)))
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.temporary.hash(state);
        // Order-insensitive combination to match the lookup-based equality.
        let mut combined: u64 = 0;
        for (k, v) in &self.values {
            let mut entry = DefaultHasher::new();
            k.hash(&mut entry);
            v.hash_into(&mut entry);
            combined = combined.wrapping_add(entry.finish());
        }
        combined.hash(state);
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = self.temporary {
            return write!(f, "<{} temp#{}>", self.entity, id);
        }
        write!(f, "<{}", self.entity)?;
        for (k, v) in &self.values {
            write!(f, " {}={}", k, v)?;
        }
        write!(f, ">")
    }
}
