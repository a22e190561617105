//! Entity and relationship metadata.
//!
//! Metadata comes in two layers. The database layer ([`DbEntity`],
//! [`DbRelationship`]) describes tables and the physical joins between them.
//! The object layer ([`EntityDescriptor`], [`RelationshipDescriptor`]) maps
//! attributes onto columns and object-level relationships onto chains of
//! database relationships. A relationship whose chain has more than one hop is
//! *flattened*, typically a many-to-many through a link table.
//!
//! Everything is assembled with [`SchemaBuilder`] and resolved once by
//! [`SchemaBuilder::build`], so the prefetch and commit code operates over
//! typed descriptors rather than looking names up at resolution time.

use crate::error::{Error, Result, SchemaErrorKind};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;

/// A physical column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbColumn {
    pub name: String,
    /// Part of the table's primary key.
    pub primary_key: bool,
    /// Value is produced by the database on insert.
    pub generated: bool,
}

impl DbColumn {
    /// A plain column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
            generated: false,
        }
    }

    /// A primary-key column whose value is supplied by the caller.
    pub fn primary_key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: true,
            generated: false,
        }
    }

    /// A primary-key column generated by the database.
    pub fn generated_key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: true,
            generated: true,
        }
    }
}

/// One column pair of a physical join.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbJoin {
    /// Column on the relationship's source table.
    pub source: String,
    /// Column on the relationship's target table.
    pub target: String,
}

/// A physical relationship between two tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbRelationship {
    pub name: String,
    pub source: String,
    pub target: String,
    pub joins: Vec<DbJoin>,
    pub to_many: bool,
}

impl DbRelationship {
    /// Create a to-one relationship with no joins yet.
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            joins: Vec::new(),
            to_many: false,
        }
    }

    /// Add a join column pair.
    #[must_use]
    pub fn join(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.joins.push(DbJoin {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// Mark the relationship as to-many.
    #[must_use]
    pub fn to_many(mut self) -> Self {
        self.to_many = true;
        self
    }

    /// Source-side join columns in join order.
    pub fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.joins.iter().map(|j| j.source.as_str())
    }

    /// Target-side join columns in join order.
    pub fn target_columns(&self) -> impl Iterator<Item = &str> {
        self.joins.iter().map(|j| j.target.as_str())
    }

    /// Whether `other` joins the same columns in the opposite direction.
    pub fn is_reverse_of(&self, other: &DbRelationship) -> bool {
        if self.source != other.target || self.target != other.source {
            return false;
        }
        if self.joins.len() != other.joins.len() {
            return false;
        }
        let mine: HashSet<(&str, &str)> = self
            .joins
            .iter()
            .map(|j| (j.source.as_str(), j.target.as_str()))
            .collect();
        other
            .joins
            .iter()
            .all(|j| mine.contains(&(j.target.as_str(), j.source.as_str())))
    }
}

/// A physical table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbEntity {
    pub name: String,
    pub columns: Vec<DbColumn>,
    pub relationships: Vec<DbRelationship>,
}

impl DbEntity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Add a column.
    #[must_use]
    pub fn column(mut self, column: DbColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a relationship. Its source is forced to this table.
    #[must_use]
    pub fn relationship(mut self, mut relationship: DbRelationship) -> Self {
        relationship.source.clone_from(&self.name);
        self.relationships.push(relationship);
        self
    }

    /// Look up a column by name.
    pub fn find_column(&self, name: &str) -> Option<&DbColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a relationship by name.
    pub fn find_relationship(&self, name: &str) -> Option<&DbRelationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Primary-key column names in declaration order.
    pub fn primary_key(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
    }
}

/// Maps one object attribute onto a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescriptor {
    pub name: String,
    pub column: String,
}

/// Arity and shape of an object-level relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    ToOne,
    ToMany,
    /// Spans more than one physical join.
    Flattened { to_many: bool },
}

impl RelationshipKind {
    pub fn is_to_many(self) -> bool {
        matches!(
            self,
            RelationshipKind::ToMany | RelationshipKind::Flattened { to_many: true }
        )
    }

    pub fn is_flattened(self) -> bool {
        matches!(self, RelationshipKind::Flattened { .. })
    }
}

/// An object-level relationship resolved to its physical join chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDescriptor {
    pub name: String,
    /// Source entity (object level).
    pub source: String,
    /// Target entity (object level).
    pub target: String,
    pub kind: RelationshipKind,
    /// Resolved physical chain, filled in by [`SchemaBuilder::build`].
    pub db_path: Vec<DbRelationship>,
    path_names: Vec<String>,
}

impl RelationshipDescriptor {
    /// Names of the physical relationships this one traverses.
    pub fn db_path_names(&self) -> impl Iterator<Item = &str> {
        self.db_path.iter().map(|r| r.name.as_str())
    }

    /// The dot-joined physical chain, e.g. `artistGroupArray.toGroup`.
    pub fn db_path_string(&self) -> String {
        self.db_path
            .iter()
            .map(|r| r.name.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// First physical hop (the one that starts at the source table).
    pub fn first_hop(&self) -> Option<&DbRelationship> {
        self.db_path.first()
    }
}

/// Object-level metadata for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub name: String,
    pub db_entity: String,
    pub attributes: Vec<AttributeDescriptor>,
    pub relationships: Vec<RelationshipDescriptor>,
    primary_key: Vec<String>,
    columns: Vec<String>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>, db_entity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db_entity: db_entity.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            primary_key: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Map an attribute onto a column.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.attributes.push(AttributeDescriptor {
            name: name.into(),
            column: column.into(),
        });
        self
    }

    /// Declare a relationship through a chain of physical relationship names.
    #[must_use]
    pub fn relationship<I, S>(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        db_path: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relationships.push(RelationshipDescriptor {
            name: name.into(),
            source: self.name.clone(),
            target: target.into(),
            kind: RelationshipKind::ToOne,
            db_path: Vec::new(),
            path_names: db_path.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Look up an attribute by name.
    pub fn find_attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Look up a relationship by name.
    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Column backing an attribute.
    pub fn column_for(&self, attribute: &str) -> Option<&str> {
        self.find_attribute(attribute).map(|a| a.column.as_str())
    }

    /// Primary-key columns of the backing table.
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// All columns of the backing table, in table order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Check if a column is part of the primary key.
    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|c| c == column)
    }
}

/// Frozen, validated metadata for a whole model.
#[derive(Debug, Default)]
pub struct Schema {
    db_entities: IndexMap<String, Arc<DbEntity>>,
    entities: IndexMap<String, Arc<EntityDescriptor>>,
    by_db_entity: IndexMap<String, String>,
}

impl Schema {
    /// Start assembling a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Look up an entity descriptor.
    pub fn entity(&self, name: &str) -> Result<&Arc<EntityDescriptor>> {
        self.entities.get(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("unknown entity '{name}'"),
            )
        })
    }

    /// Look up a table.
    pub fn db_entity(&self, name: &str) -> Result<&Arc<DbEntity>> {
        self.db_entities.get(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("unknown table '{name}'"),
            )
        })
    }

    /// The object entity mapped onto a table, if any.
    pub fn entity_for_table(&self, db_entity: &str) -> Option<&Arc<EntityDescriptor>> {
        self.by_db_entity
            .get(db_entity)
            .and_then(|name| self.entities.get(name))
    }

    /// Look up an object-level relationship.
    pub fn relationship(&self, entity: &str, name: &str) -> Result<&RelationshipDescriptor> {
        self.entity(entity)?.find_relationship(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownRelationship,
                format!("entity '{entity}' has no relationship '{name}'"),
            )
        })
    }

    /// The physical relationship joining the same columns in the other direction.
    ///
    /// Always present after [`SchemaBuilder::build`], which synthesizes missing reverses.
    pub fn reverse(&self, relationship: &DbRelationship) -> Result<&DbRelationship> {
        self.db_entity(&relationship.target)?
            .relationships
            .iter()
            .find(|r| r.is_reverse_of(relationship))
            .ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::UnknownRelationship,
                    format!(
                        "no reverse of {}.{}",
                        relationship.source, relationship.name
                    ),
                )
            })
    }

    /// Whether a relationship's target columns are exactly the target's primary key.
    pub fn joins_target_key(&self, relationship: &DbRelationship) -> bool {
        let Ok(target) = self.db_entity(&relationship.target) else {
            return false;
        };
        let pk: HashSet<&str> = target.primary_key().collect();
        let targets: HashSet<&str> = relationship.target_columns().collect();
        !pk.is_empty() && pk == targets
    }

    /// All entity descriptors in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.values()
    }

    /// All tables in declaration order.
    pub fn db_entities(&self) -> impl Iterator<Item = &Arc<DbEntity>> {
        self.db_entities.values()
    }
}

/// Collects metadata and resolves it into a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    db_entities: Vec<DbEntity>,
    entities: Vec<EntityDescriptor>,
}

impl SchemaBuilder {
    /// Add a table.
    #[must_use]
    pub fn db_entity(mut self, entity: DbEntity) -> Self {
        self.db_entities.push(entity);
        self
    }

    /// Add an object entity.
    #[must_use]
    pub fn entity(mut self, entity: EntityDescriptor) -> Self {
        self.entities.push(entity);
        self
    }

    /// Validate and freeze the metadata.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn build(self) -> Result<Schema> {
        let mut tables: IndexMap<String, DbEntity> = IndexMap::new();
        for table in self.db_entities {
            if tables.contains_key(&table.name) {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    format!("table '{}' declared twice", table.name),
                ));
            }
            if table.primary_key().next().is_none() {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    format!("table '{}' has no primary key", table.name),
                ));
            }
            tables.insert(table.name.clone(), table);
        }

        validate_db_relationships(&tables)?;
        synthesize_reverses(&mut tables);

        let mut entities = IndexMap::new();
        let mut by_db_entity = IndexMap::new();
        for mut entity in self.entities {
            let table = tables.get(&entity.db_entity).ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::UnknownEntity,
                    format!(
                        "entity '{}' maps to unknown table '{}'",
                        entity.name, entity.db_entity
                    ),
                )
            })?;
            for attribute in &entity.attributes {
                if table.find_column(&attribute.column).is_none() {
                    return Err(Error::schema(
                        SchemaErrorKind::UnknownColumn,
                        format!(
                            "attribute {}.{} maps to unknown column '{}'",
                            entity.name, attribute.name, attribute.column
                        ),
                    ));
                }
            }
            entity.primary_key = table.primary_key().map(str::to_string).collect();
            entity.columns = table.columns.iter().map(|c| c.name.clone()).collect();
            by_db_entity.insert(entity.db_entity.clone(), entity.name.clone());
            entities.insert(entity.name.clone(), entity);
        }

        let targets: IndexMap<String, String> = entities
            .values()
            .map(|e: &EntityDescriptor| (e.name.clone(), e.db_entity.clone()))
            .collect();
        for entity in entities.values_mut() {
            for relationship in &mut entity.relationships {
                resolve_relationship(&entity.db_entity, relationship, &tables, &targets)?;
            }
        }

        tracing::debug!(
            tables = tables.len(),
            entities = entities.len(),
            "Schema resolved"
        );

        Ok(Schema {
            db_entities: tables
                .into_iter()
                .map(|(name, table)| (name, Arc::new(table)))
                .collect(),
            entities: entities
                .into_iter()
                .map(|(name, entity)| (name, Arc::new(entity)))
                .collect(),
            by_db_entity,
        })
    }
}

fn validate_db_relationships(tables: &IndexMap<String, DbEntity>) -> Result<()> {
    for table in tables.values() {
        for relationship in &table.relationships {
            let target = tables.get(&relationship.target).ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::UnknownEntity,
                    format!(
                        "relationship {}.{} targets unknown table '{}'",
                        table.name, relationship.name, relationship.target
                    ),
                )
            })?;
            if relationship.joins.is_empty() {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    format!("relationship {}.{} has no joins", table.name, relationship.name),
                ));
            }
            for join in &relationship.joins {
                let missing = if table.find_column(&join.source).is_none() {
                    Some((&table.name, &join.source))
                } else if target.find_column(&join.target).is_none() {
                    Some((&target.name, &join.target))
                } else {
                    None
                };
                if let Some((owner, column)) = missing {
                    return Err(Error::schema(
                        SchemaErrorKind::UnknownColumn,
                        format!(
                            "relationship {}.{} joins unknown column {}.{}",
                            table.name, relationship.name, owner, column
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Add the reverse of every physical relationship that lacks one.
///
/// A reverse is to-one when it joins onto the other table's primary key.
fn synthesize_reverses(tables: &mut IndexMap<String, DbEntity>) {
    let mut missing = Vec::new();
    for table in tables.values() {
        for relationship in &table.relationships {
            let Some(target) = tables.get(&relationship.target) else {
                continue;
            };
            let has_reverse = target
                .relationships
                .iter()
                .any(|r| r.is_reverse_of(relationship))
                || missing
                    .iter()
                    .any(|r: &DbRelationship| r.is_reverse_of(relationship));
            if has_reverse {
                continue;
            }
            let pk: HashSet<&str> = table.primary_key().collect();
            let joined: HashSet<&str> = relationship.source_columns().collect();
            missing.push(DbRelationship {
                name: format!("{}_{}_reverse", relationship.source, relationship.name),
                source: relationship.target.clone(),
                target: relationship.source.clone(),
                joins: relationship
                    .joins
                    .iter()
                    .map(|j| DbJoin {
                        source: j.target.clone(),
                        target: j.source.clone(),
                    })
                    .collect(),
                to_many: pk != joined,
            });
        }
    }
    for reverse in missing {
        tracing::trace!(
            table = %reverse.source,
            relationship = %reverse.name,
            "Synthesized reverse relationship"
        );
        if let Some(table) = tables.get_mut(&reverse.source) {
            table.relationships.push(reverse);
        }
    }
}

fn resolve_relationship(
    db_entity: &str,
    relationship: &mut RelationshipDescriptor,
    tables: &IndexMap<String, DbEntity>,
    targets: &IndexMap<String, String>,
) -> Result<()> {
    let invalid = |message: String| Error::schema(SchemaErrorKind::Invalid, message);
    let target_table = targets.get(&relationship.target).ok_or_else(|| {
        Error::schema(
            SchemaErrorKind::UnknownEntity,
            format!(
                "relationship {}.{} targets unknown entity '{}'",
                relationship.source, relationship.name, relationship.target
            ),
        )
    })?;
    if relationship.path_names.is_empty() {
        return Err(invalid(format!(
            "relationship {}.{} has an empty database path",
            relationship.source, relationship.name
        )));
    }

    let mut current = db_entity;
    let mut chain = Vec::with_capacity(relationship.path_names.len());
    for hop in &relationship.path_names {
        let table = tables.get(current).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("unknown table '{current}'"),
            )
        })?;
        let db_relationship = table.find_relationship(hop).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownRelationship,
                format!(
                    "relationship {}.{} uses unknown database relationship {}.{}",
                    relationship.source, relationship.name, current, hop
                ),
            )
        })?;
        current = &db_relationship.target;
        chain.push(db_relationship.clone());
    }
    if current != target_table {
        return Err(invalid(format!(
            "relationship {}.{} ends at table '{}', expected '{}'",
            relationship.source, relationship.name, current, target_table
        )));
    }

    relationship.kind = if chain.len() == 1 {
        if chain[0].to_many {
            RelationshipKind::ToMany
        } else {
            RelationshipKind::ToOne
        }
    } else {
        RelationshipKind::Flattened {
            to_many: chain.iter().any(|r| r.to_many),
        }
    };
    relationship.db_path = chain;
    Ok(())
}
