//! Core types for the objgraph persistence engine.
//!
//! This crate provides the leaf abstractions everything else is built on:
//!
//! - `Value` and `Row` for flat query results
//! - `IdentityKey` naming one persisted row
//! - `RowSnapshot` and the snapshot difference rule
//! - `Schema` with typed entity and relationship metadata
//! - `QueryLayer`, the contract with the SQL collaborator

pub mod error;
pub mod identity;
pub mod query;
pub mod row;
pub mod schema;
pub mod snapshot;
pub mod value;

pub use error::{
    ConflictError, Error, FaultError, PathError, PathErrorKind, QueryError, QueryErrorKind,
    Result, SchemaError, SchemaErrorKind, SessionError, SessionErrorKind, StateError,
    StateErrorKind, with_query_context,
};
pub use identity::{IdentityKey, make_key};
pub use query::{
    ColumnPath, JoinedNode, JoinedSelect, Qualifier, QueryLayer, WriteKind, WritePayload,
    WriteResult,
};
pub use row::{ColumnInfo, Row};
pub use schema::{
    AttributeDescriptor, DbColumn, DbEntity, DbJoin, DbRelationship, EntityDescriptor,
    RelationshipDescriptor, RelationshipKind, Schema, SchemaBuilder,
};
pub use snapshot::{RowSnapshot, diff_snapshots, snapshot_from_row};
pub use value::Value;
