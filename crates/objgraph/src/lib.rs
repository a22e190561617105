//! objgraph - the persistence core of an object-graph mapper.
//!
//! objgraph turns flat rows into a uniqued, linked graph of domain objects and
//! writes changes back as minimal statements:
//!
//! - Identity mapping: one object per identity key per session
//! - Relationship faults resolved lazily on first access
//! - Joint (outer-joined) and disjoint (per-relationship) prefetching
//! - Snapshot diffing and parent-first commit ordering
//! - A shared snapshot cache that keeps concurrent sessions in step
//!
//! SQL generation and execution live behind the [`QueryLayer`] trait.
//!
//! # Quick Start
//!
//! ```ignore
//! use objgraph::prelude::*;
//!
//! let registry = SessionRegistry::new(schema, query_layer, RegistryConfig::default());
//! registry.init()?;
//! let session = registry.new_session()?;
//!
//! let query = SelectQuery::new("Painting").prefetch("toArtist", PrefetchSemantics::Joint);
//! let paintings = registry.perform_query(session, &query)?;
//!
//! registry.with_session(session, |s| {
//!     let artist = s.to_one(paintings[0], "toArtist")?;
//!     s.write(paintings[0], "paintingTitle", "Nocturne")?;
//!     s.commit_changes()
//! })?;
//! ```

// Re-export all public types from sub-crates
pub use objgraph_core::{
    AttributeDescriptor, ColumnInfo, ColumnPath, ConflictError, DbColumn, DbEntity, DbJoin,
    DbRelationship, EntityDescriptor, Error, FaultError, IdentityKey, JoinedNode, JoinedSelect,
    PathError, PathErrorKind, Qualifier, QueryError, QueryErrorKind, QueryLayer,
    RelationshipDescriptor, RelationshipKind, Result, Row, RowSnapshot, Schema, SchemaBuilder,
    SchemaError, SchemaErrorKind, SessionError, SessionErrorKind, StateError, StateErrorKind,
    Value, WriteKind, WritePayload, WriteResult, diff_snapshots, make_key, snapshot_from_row,
};
pub use objgraph_prefetch::{
    NodeColumns, NodeId, PhantomPolicy, PrefetchConfig, PrefetchNode, PrefetchTree,
    RelationshipPath,
};
pub use objgraph_session::{
    CacheConfig, CacheStats, CommitSummary, Fault, FaultStats, FaultSummary, FlushOrderer,
    FlushPlan, LifecycleEvent, LinkOp, ObjectChange, ObjectEntry, ObjectId, ObjectState,
    ObjectStore, PrefetchSemantics, RegistryConfig, SelectQuery, Session, SessionConfig,
    SessionRegistry, SnapshotBatch, SnapshotCache, SnapshotListener, SubscriptionId,
};

/// Commonly used types.
///
/// ```ignore
/// use objgraph::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Metadata
        DbColumn,
        DbEntity,
        DbRelationship,
        EntityDescriptor,
        // Errors
        Error,
        // Faults and objects
        Fault,
        IdentityKey,
        ObjectId,
        ObjectState,
        // Query collaborator
        Qualifier,
        QueryLayer,
        Result,
        Row,
        RowSnapshot,
        Schema,
        // Sessions
        PrefetchSemantics,
        RegistryConfig,
        SelectQuery,
        Session,
        SessionConfig,
        SessionRegistry,
        SnapshotCache,
        Value,
        make_key,
    };
}
