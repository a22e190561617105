//! Prefetch tree construction for objgraph.
//!
//! Turns dot-separated relationship paths into a [`PrefetchTree`] whose nodes
//! carry physical column prefixes and column plans. The tree is consumed by
//! the joint and disjoint resolvers in `objgraph-session` and, through
//! [`PrefetchTree::joined_select`], by the SQL collaborator.

pub mod columns;
pub mod path;
pub mod tree;

pub use columns::{ColumnSource, NodeColumns};
pub use path::RelationshipPath;
pub use tree::{NodeId, PhantomPolicy, PrefetchConfig, PrefetchNode, PrefetchTree};
