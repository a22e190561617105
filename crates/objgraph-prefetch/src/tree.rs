//! Prefetch trees.
//!
//! A tree mirrors a set of relationship paths rooted at one entity. Shared
//! prefixes share nodes, and each node knows its physical column prefix and
//! its column plan, so a resolver can read every node's slice out of the same
//! flat row.

use crate::columns::NodeColumns;
use crate::path::RelationshipPath;
use indexmap::IndexMap;
use objgraph_core::{
    EntityDescriptor, JoinedNode, JoinedSelect, Qualifier, RelationshipDescriptor, Result, Schema,
};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Index of a node within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// The root node of every tree.
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// Which intermediate nodes are reported as phantom.
///
/// Phantom nodes are always traversed and linked. The policy only decides
/// which nodes the query collaborator sees flagged as "not requested".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PhantomPolicy {
    /// No node is phantom.
    None,
    /// Every node that was not itself requested is phantom.
    #[default]
    Intermediate,
    /// Unrequested to-many nodes are phantom only when the query qualifier
    /// references a column on or below them.
    QualifierBlocked,
}

/// Prefetch behavior shared by all queries of a session.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Phantom marking policy for joined prefetch.
    pub phantom_policy: PhantomPolicy,
    /// Route paths crossing more than one to-many relationship to disjoint prefetch.
    pub auto_disjoint: bool,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            phantom_policy: PhantomPolicy::Intermediate,
            auto_disjoint: true,
        }
    }
}

impl PrefetchConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the phantom policy.
    #[must_use]
    pub fn phantom_policy(mut self, policy: PhantomPolicy) -> Self {
        self.phantom_policy = policy;
        self
    }

    /// Enable or disable automatic disjoint routing.
    #[must_use]
    pub fn auto_disjoint(mut self, enabled: bool) -> Self {
        self.auto_disjoint = enabled;
        self
    }
}

/// One step of a prefetch tree.
#[derive(Debug, Clone)]
pub struct PrefetchNode {
    id: NodeId,
    parent: Option<NodeId>,
    entity: Arc<EntityDescriptor>,
    incoming: Option<RelationshipDescriptor>,
    children: IndexMap<String, NodeId>,
    path: String,
    db_path: Vec<String>,
    requested: bool,
    phantom: bool,
    columns: NodeColumns,
}

impl PrefetchNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Entity materialized at this node.
    pub fn entity(&self) -> &Arc<EntityDescriptor> {
        &self.entity
    }

    /// Relationship from the parent node (absent at the root).
    pub fn incoming(&self) -> Option<&RelationshipDescriptor> {
        self.incoming.as_ref()
    }

    /// Children in creation order.
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.values().copied()
    }

    /// Child reached through the named relationship.
    pub fn child(&self, relationship: &str) -> Option<NodeId> {
        self.children.get(relationship).copied()
    }

    /// Object-level path from the root (empty at the root).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Physical relationship names from the root.
    pub fn db_path(&self) -> &[String] {
        &self.db_path
    }

    /// Dot-joined physical relationship chain from the root (empty at the root).
    pub fn build_prefix(&self) -> String {
        self.db_path.join(".")
    }

    /// Flat-row label holding this node's value for a target column.
    pub fn source_for_target(&self, column: &str) -> Option<&str> {
        self.columns.source_for_target(column)
    }

    pub fn columns(&self) -> &NodeColumns {
        &self.columns
    }

    /// Named explicitly by one of the requested paths.
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn is_phantom(&self) -> bool {
        self.phantom
    }
}

/// A tree of prefetch paths rooted at one entity.
#[derive(Debug, Clone)]
pub struct PrefetchTree {
    nodes: Vec<PrefetchNode>,
}

impl PrefetchTree {
    /// Build a tree from relationship paths.
    ///
    /// Paths are validated before any node is created, so a malformed path
    /// fails the whole build. The result does not depend on path order.
    #[tracing::instrument(level = "debug", skip(schema, paths, qualifier))]
    pub fn build<S: AsRef<str>>(
        schema: &Schema,
        root: &str,
        paths: &[S],
        qualifier: &Qualifier,
        policy: PhantomPolicy,
    ) -> Result<Self> {
        let root_entity = Arc::clone(schema.entity(root)?);

        let mut parsed = BTreeSet::new();
        for path in paths {
            let path = RelationshipPath::parse(root, path.as_ref())?;
            path.resolve(schema, root)?;
            parsed.insert(path);
        }

        let mut tree = Self {
            nodes: vec![PrefetchNode {
                id: NodeId::ROOT,
                parent: None,
                columns: NodeColumns::for_root(&root_entity),
                entity: root_entity,
                incoming: None,
                children: IndexMap::new(),
                path: String::new(),
                db_path: Vec::new(),
                requested: true,
                phantom: false,
            }],
        };

        for path in &parsed {
            let steps = path.resolve(schema, root)?;
            let mut current = NodeId::ROOT;
            for (depth, relationship) in steps.into_iter().enumerate() {
                current = match tree.nodes[current.0].child(&relationship.name) {
                    Some(existing) => existing,
                    None => tree.add_child(schema, current, relationship)?,
                };
                if depth + 1 == path.len() {
                    tree.nodes[current.0].requested = true;
                }
            }
        }

        tree.mark_phantoms(qualifier, policy);
        tracing::debug!(
            root = root,
            nodes = tree.nodes.len(),
            phantoms = tree.nodes.iter().filter(|n| n.phantom).count(),
            "Built prefetch tree"
        );
        Ok(tree)
    }

    fn add_child(
        &mut self,
        schema: &Schema,
        parent: NodeId,
        relationship: &RelationshipDescriptor,
    ) -> Result<NodeId> {
        let id = NodeId(self.nodes.len());
        let parent_node = &self.nodes[parent.0];
        let entity = Arc::clone(schema.entity(&relationship.target)?);

        let mut db_path = parent_node.db_path.clone();
        db_path.extend(relationship.db_path_names().map(str::to_string));

        // A plain join's target columns carry the same values as the parent's
        // source columns, so they are read from the parent's segment.
        let inherited: Vec<(&str, &str)> = if relationship.kind.is_flattened() {
            Vec::new()
        } else {
            relationship
                .first_hop()
                .map(|hop| {
                    hop.joins
                        .iter()
                        .filter_map(|j| {
                            parent_node
                                .source_for_target(&j.source)
                                .map(|label| (j.target.as_str(), label))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let columns = NodeColumns::plan(&entity, &db_path, inherited);

        let path = if parent_node.path.is_empty() {
            relationship.name.clone()
        } else {
            format!("{}.{}", parent_node.path, relationship.name)
        };
        tracing::trace!(path = %path, prefix = %db_path.join("."), "Added prefetch node");

        self.nodes.push(PrefetchNode {
            id,
            parent: Some(parent),
            entity,
            incoming: Some(relationship.clone()),
            children: IndexMap::new(),
            path,
            db_path,
            requested: false,
            phantom: false,
            columns,
        });
        self.nodes[parent.0]
            .children
            .insert(relationship.name.clone(), id);
        Ok(id)
    }

    fn mark_phantoms(&mut self, qualifier: &Qualifier, policy: PhantomPolicy) {
        let qualified = qualifier.column_paths();
        for node in self.nodes.iter_mut().skip(1) {
            node.phantom = match policy {
                PhantomPolicy::None => false,
                PhantomPolicy::Intermediate => !node.requested,
                PhantomPolicy::QualifierBlocked => {
                    !node.requested
                        && node.incoming.as_ref().is_some_and(|r| r.kind.is_to_many())
                        && qualified.iter().any(|p| p.is_under(&node.db_path))
                }
            };
        }
    }

    pub fn root(&self) -> &PrefetchNode {
        &self.nodes[0]
    }

    /// Get a node by id.
    ///
    /// # Panics
    ///
    /// Panics if the id belongs to another tree.
    pub fn node(&self, id: NodeId) -> &PrefetchNode {
        &self.nodes[id.0]
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when only the root is present.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// All nodes, parents before children.
    pub fn nodes(&self) -> impl Iterator<Item = &PrefetchNode> {
        self.nodes.iter()
    }

    /// Nodes that stand for requested data (the root is never phantom).
    pub fn non_phantom_nodes(&self) -> impl Iterator<Item = &PrefetchNode> {
        self.nodes.iter().filter(|n| !n.phantom)
    }

    /// Find the node for an object-level path (`""` is the root).
    pub fn find(&self, path: &str) -> Option<&PrefetchNode> {
        self.nodes.iter().find(|n| n.path == path)
    }

    /// Describe the joins and labels the collaborator must produce.
    pub fn joined_select(&self) -> JoinedSelect {
        JoinedSelect {
            root: self.root().entity.name.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|n| JoinedNode {
                    entity: n.entity.name.clone(),
                    db_path: n.db_path.clone(),
                    phantom: n.phantom,
                    columns: n
                        .columns
                        .entries()
                        .iter()
                        .map(|e| (e.column.clone(), e.label.clone()))
                        .collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objgraph_core::{
        ColumnPath, DbColumn, DbEntity, DbRelationship, Error, PathErrorKind, Value,
    };

    fn schema() -> Schema {
        Schema::builder()
            .db_entity(
                DbEntity::new("ARTIST")
                    .column(DbColumn::primary_key("ARTIST_ID"))
                    .column(DbColumn::new("ARTIST_NAME"))
                    .relationship(
                        DbRelationship::new("paintingArray", "ARTIST", "PAINTING")
                            .join("ARTIST_ID", "ARTIST_ID")
                            .to_many(),
                    )
                    .relationship(
                        DbRelationship::new("artistGroupArray", "ARTIST", "ARTIST_GROUP")
                            .join("ARTIST_ID", "ARTIST_ID")
                            .to_many(),
                    ),
            )
            .db_entity(
                DbEntity::new("PAINTING")
                    .column(DbColumn::primary_key("PAINTING_ID"))
                    .column(DbColumn::new("ARTIST_ID"))
                    .column(DbColumn::new("GALLERY_ID"))
                    .relationship(
                        DbRelationship::new("toArtist", "PAINTING", "ARTIST")
                            .join("ARTIST_ID", "ARTIST_ID"),
                    )
                    .relationship(
                        DbRelationship::new("toGallery", "PAINTING", "GALLERY")
                            .join("GALLERY_ID", "GALLERY_ID"),
                    ),
            )
            .db_entity(
                DbEntity::new("GALLERY")
                    .column(DbColumn::primary_key("GALLERY_ID"))
                    .column(DbColumn::new("GALLERY_NAME")),
            )
            .db_entity(
                DbEntity::new("ARTIST_GROUP")
                    .column(DbColumn::primary_key("ARTIST_ID"))
                    .column(DbColumn::primary_key("GROUP_ID"))
                    .relationship(
                        DbRelationship::new("toGroup", "ARTIST_GROUP", "ARTGROUP")
                            .join("GROUP_ID", "GROUP_ID"),
                    ),
            )
            .db_entity(
                DbEntity::new("ARTGROUP")
                    .column(DbColumn::primary_key("GROUP_ID"))
                    .column(DbColumn::new("NAME")),
            )
            .entity(
                EntityDescriptor::new("Artist", "ARTIST")
                    .attribute("artistName", "ARTIST_NAME")
                    .relationship("paintingArray", "Painting", ["paintingArray"])
                    .relationship("groupArray", "ArtGroup", ["artistGroupArray", "toGroup"]),
            )
            .entity(
                EntityDescriptor::new("Painting", "PAINTING")
                    .relationship("toArtist", "Artist", ["toArtist"])
                    .relationship("toGallery", "Gallery", ["toGallery"]),
            )
            .entity(EntityDescriptor::new("Gallery", "GALLERY").attribute("name", "GALLERY_NAME"))
            .entity(EntityDescriptor::new("ArtGroup", "ARTGROUP").attribute("name", "NAME"))
            .build()
            .unwrap()
    }

    fn shape(tree: &PrefetchTree) -> Vec<(String, String, bool)> {
        let mut out: Vec<_> = tree
            .nodes()
            .map(|n| (n.path().to_string(), n.build_prefix(), n.is_phantom()))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_shared_prefixes_share_nodes() {
        let schema = schema();
        let tree = PrefetchTree::build(
            &schema,
            "Painting",
            &["toArtist.groupArray", "toArtist", "toArtist.paintingArray"],
            &Qualifier::All,
            PhantomPolicy::Intermediate,
        )
        .unwrap();
        assert_eq!(tree.len(), 4);
        let artist = tree.find("toArtist").unwrap();
        assert_eq!(artist.children().count(), 2);
        assert!(artist.is_requested());
    }

    #[test]
    fn test_build_is_order_independent() {
        let schema = schema();
        let paths = ["toArtist.groupArray", "toGallery", "toArtist.paintingArray"];
        let mut reversed = paths;
        reversed.reverse();
        let a = PrefetchTree::build(
            &schema,
            "Painting",
            &paths,
            &Qualifier::All,
            PhantomPolicy::Intermediate,
        )
        .unwrap();
        let b = PrefetchTree::build(
            &schema,
            "Painting",
            &reversed,
            &Qualifier::All,
            PhantomPolicy::Intermediate,
        )
        .unwrap();
        assert_eq!(shape(&a), shape(&b));
        assert_eq!(a.joined_select(), b.joined_select());
    }

    #[test]
    fn test_flattened_prefix_uses_physical_names() {
        let schema = schema();
        let tree = PrefetchTree::build(
            &schema,
            "Painting",
            &["toArtist.groupArray"],
            &Qualifier::All,
            PhantomPolicy::Intermediate,
        )
        .unwrap();
        let groups = tree.find("toArtist.groupArray").unwrap();
        assert_eq!(groups.build_prefix(), "toArtist.artistGroupArray.toGroup");
        assert_eq!(
            groups.source_for_target("GROUP_ID"),
            Some("toArtist.artistGroupArray.toGroup.GROUP_ID")
        );
        assert_eq!(tree.root().build_prefix(), "");
    }

    #[test]
    fn test_source_for_target_propagates_parent_columns() {
        let schema = schema();
        let tree = PrefetchTree::build(
            &schema,
            "Artist",
            &["paintingArray"],
            &Qualifier::All,
            PhantomPolicy::Intermediate,
        )
        .unwrap();
        let paintings = tree.find("paintingArray").unwrap();
        assert_eq!(paintings.source_for_target("ARTIST_ID"), Some("ARTIST_ID"));
        assert_eq!(
            paintings.source_for_target("PAINTING_ID"),
            Some("paintingArray.PAINTING_ID")
        );
        let labels = tree.joined_select();
        assert_eq!(labels.labels().iter().filter(|l| **l == "ARTIST_ID").count(), 1);
    }

    #[test]
    fn test_phantom_policies() {
        let schema = schema();
        let qualifier = Qualifier::eq(
            ColumnPath::through(["paintingArray", "toGallery"], "GALLERY_NAME"),
            Value::from("Louvre"),
        );
        let paths = ["paintingArray.toGallery"];

        let tree =
            PrefetchTree::build(&schema, "Artist", &paths, &qualifier, PhantomPolicy::Intermediate)
                .unwrap();
        assert!(tree.find("paintingArray").unwrap().is_phantom());
        assert!(!tree.find("paintingArray.toGallery").unwrap().is_phantom());
        assert_eq!(tree.non_phantom_nodes().count(), 2);

        let tree = PrefetchTree::build(
            &schema,
            "Artist",
            &paths,
            &Qualifier::All,
            PhantomPolicy::QualifierBlocked,
        )
        .unwrap();
        assert!(!tree.find("paintingArray").unwrap().is_phantom());

        let tree = PrefetchTree::build(
            &schema,
            "Artist",
            &paths,
            &qualifier,
            PhantomPolicy::QualifierBlocked,
        )
        .unwrap();
        assert!(tree.find("paintingArray").unwrap().is_phantom());

        let tree = PrefetchTree::build(&schema, "Artist", &paths, &qualifier, PhantomPolicy::None)
            .unwrap();
        assert_eq!(tree.non_phantom_nodes().count(), 3);
    }

    #[test]
    fn test_unknown_relationship_fails_before_building() {
        let schema = schema();
        let err = PrefetchTree::build(
            &schema,
            "Painting",
            &["toArtist", "toArtist.nope"],
            &Qualifier::All,
            PhantomPolicy::Intermediate,
        )
        .unwrap_err();
        match err {
            Error::Path(e) => {
                assert_eq!(e.kind, PathErrorKind::UnknownRelationship);
                assert_eq!(e.path, "toArtist.nope");
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
