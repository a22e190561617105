//! The query collaborator contract.
//!
//! SQL generation and execution live outside this workspace. The engine talks
//! to them through [`QueryLayer`], handing over typed metadata, a
//! [`Qualifier`] and, for joined prefetch, a [`JoinedSelect`] describing which
//! physical joins to emit and under which labels each column must come back.

use crate::error::Result;
use crate::identity::IdentityKey;
use crate::row::Row;
use crate::schema::{DbEntity, EntityDescriptor};
use crate::snapshot::RowSnapshot;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// A column reached by following physical relationships from a query root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnPath {
    /// Physical relationship names, root first. Empty for root columns.
    pub db_path: Vec<String>,
    pub column: String,
}

impl ColumnPath {
    /// A column of the query root itself.
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            db_path: Vec::new(),
            column: column.into(),
        }
    }

    /// A column reached through the given relationship chain.
    pub fn through<I, S>(db_path: I, column: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            db_path: db_path.into_iter().map(Into::into).collect(),
            column: column.into(),
        }
    }

    /// Flat-row label for this column (`a.b.COLUMN`).
    pub fn label(&self) -> String {
        self.to_string()
    }

    /// Whether this column lies on or below the given relationship chain.
    pub fn is_under(&self, db_path: &[String]) -> bool {
        self.db_path.len() >= db_path.len() && self.db_path[..db_path.len()] == *db_path
    }
}

impl fmt::Display for ColumnPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.db_path {
            write!(f, "{}.", segment)?;
        }
        write!(f, "{}", self.column)
    }
}

/// Row filter handed to the query collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum Qualifier {
    /// No restriction.
    All,
    /// `column = value`.
    Eq { column: ColumnPath, value: Value },
    /// Tuple membership: `(c1, c2, ...) IN ((v1, v2, ...), ...)`.
    KeyIn {
        columns: Vec<ColumnPath>,
        keys: Vec<Vec<Value>>,
    },
    And(Vec<Qualifier>),
    Or(Vec<Qualifier>),
}

impl Qualifier {
    /// `column = value`.
    pub fn eq(column: ColumnPath, value: impl Into<Value>) -> Self {
        Qualifier::Eq {
            column,
            value: value.into(),
        }
    }

    /// Match rows whose primary key equals the given identity key.
    pub fn for_key(key: &IdentityKey) -> Self {
        let mut parts: Vec<Qualifier> = key
            .values()
            .iter()
            .map(|(column, value)| Qualifier::eq(ColumnPath::new(column.clone()), value.clone()))
            .collect();
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Qualifier::And(parts)
        }
    }

    /// Conjunction, collapsing `All` operands.
    #[must_use]
    pub fn and(self, other: Qualifier) -> Self {
        match (self, other) {
            (Qualifier::All, q) | (q, Qualifier::All) => q,
            (Qualifier::And(mut left), Qualifier::And(right)) => {
                left.extend(right);
                Qualifier::And(left)
            }
            (Qualifier::And(mut left), q) => {
                left.push(q);
                Qualifier::And(left)
            }
            (left, right) => Qualifier::And(vec![left, right]),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Qualifier::All)
    }

    /// Every column path this qualifier mentions.
    pub fn column_paths(&self) -> Vec<&ColumnPath> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a ColumnPath>) {
        match self {
            Qualifier::All => {}
            Qualifier::Eq { column, .. } => out.push(column),
            Qualifier::KeyIn { columns, .. } => out.extend(columns.iter()),
            Qualifier::And(parts) | Qualifier::Or(parts) => {
                for part in parts {
                    part.collect_paths(out);
                }
            }
        }
    }

    /// Evaluate against a labelled row. A missing label never matches.
    ///
    /// NULL never equals anything, including NULL.
    pub fn matches(&self, row: &Row) -> bool {
        let equal = |path: &ColumnPath, expected: &Value| {
            row.get_by_name(&path.label())
                .is_some_and(|actual| !actual.is_null() && actual.same_as(expected))
        };
        match self {
            Qualifier::All => true,
            Qualifier::Eq { column, value } => equal(column, value),
            Qualifier::KeyIn { columns, keys } => keys.iter().any(|key| {
                key.len() == columns.len() && columns.iter().zip(key).all(|(c, v)| equal(c, v))
            }),
            Qualifier::And(parts) => parts.iter().all(|q| q.matches(row)),
            Qualifier::Or(parts) => parts.iter().any(|q| q.matches(row)),
        }
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qualifier::All => write!(f, "TRUE"),
            Qualifier::Eq { column, value } => write!(f, "{} = {}", column, value),
            Qualifier::KeyIn { columns, keys } => {
                let columns: Vec<String> = columns.iter().map(ToString::to_string).collect();
                write!(f, "({}) IN ({} keys)", columns.join(", "), keys.len())
            }
            Qualifier::And(parts) | Qualifier::Or(parts) => {
                let op = if matches!(self, Qualifier::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                let parts: Vec<String> = parts.iter().map(|p| format!("({p})")).collect();
                write!(f, "{}", parts.join(op))
            }
        }
    }
}

/// One entity segment of a joined select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedNode {
    /// Object entity materialized from this segment.
    pub entity: String,
    /// Physical relationship chain from the root. Empty for the root.
    pub db_path: Vec<String>,
    /// Reached only as a hop toward a deeper node.
    ///
    /// The join must still be emitted because deeper columns come through it,
    /// but the collaborator may decide not to let qualifiers on this segment
    /// restrict the root.
    pub phantom: bool,
    /// `(column, label)` pairs. Labels that repeat an ancestor's label are
    /// supplied by that ancestor and need not be selected twice.
    pub columns: Vec<(String, String)>,
}

/// What a joined prefetch needs from the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedSelect {
    pub root: String,
    /// Root first, parents before children.
    pub nodes: Vec<JoinedNode>,
}

impl JoinedSelect {
    /// Distinct labels the result rows must carry, in select order.
    pub fn labels(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.nodes
            .iter()
            .flat_map(|n| n.columns.iter().map(|(_, label)| label.as_str()))
            .filter(|label| seen.insert(*label))
            .collect()
    }
}

/// Kind of statement a write carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl WriteKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            WriteKind::Insert => "INSERT",
            WriteKind::Update => "UPDATE",
            WriteKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data for one write statement.
///
/// `key` qualifies updates and deletes. For inserts it is the temporary key
/// assigned by the session and `values` is the full row.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePayload {
    pub key: IdentityKey,
    pub values: RowSnapshot,
}

/// Outcome of one write statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    pub affected: u64,
    /// Primary-key columns produced by the database on insert.
    pub generated_key: Option<RowSnapshot>,
}

impl WriteResult {
    pub fn affected(affected: u64) -> Self {
        Self {
            affected,
            generated_key: None,
        }
    }

    #[must_use]
    pub fn with_generated_key(mut self, key: RowSnapshot) -> Self {
        self.generated_key = Some(key);
        self
    }
}

/// Narrow interface onto SQL generation and execution.
///
/// Calls are synchronous and may block on a database round trip.
pub trait QueryLayer: Send + Sync {
    /// Fetch rows of one entity.
    ///
    /// Rows carry the entity's plain column names, plus the label of every
    /// [`ColumnPath`] named by a [`Qualifier::KeyIn`] in `qualifier`.
    fn execute_query(&self, entity: &EntityDescriptor, qualifier: &Qualifier) -> Result<Vec<Row>>;

    /// Fetch flat rows for a joined prefetch, labelled as `select` dictates.
    fn execute_joined_query(
        &self,
        root: &EntityDescriptor,
        select: &JoinedSelect,
        qualifier: &Qualifier,
    ) -> Result<Vec<Row>>;

    /// Execute one insert, update or delete.
    fn execute_write(
        &self,
        kind: WriteKind,
        entity: &DbEntity,
        payload: &WritePayload,
    ) -> Result<WriteResult>;
}

impl<T: QueryLayer + ?Sized> QueryLayer for &T {
    fn execute_query(&self, entity: &EntityDescriptor, qualifier: &Qualifier) -> Result<Vec<Row>> {
        (**self).execute_query(entity, qualifier)
    }

    fn execute_joined_query(
        &self,
        root: &EntityDescriptor,
        select: &JoinedSelect,
        qualifier: &Qualifier,
    ) -> Result<Vec<Row>> {
        (**self).execute_joined_query(root, select, qualifier)
    }

    fn execute_write(
        &self,
        kind: WriteKind,
        entity: &DbEntity,
        payload: &WritePayload,
    ) -> Result<WriteResult> {
        (**self).execute_write(kind, entity, payload)
    }
}

impl<T: QueryLayer + ?Sized> QueryLayer for Arc<T> {
    fn execute_query(&self, entity: &EntityDescriptor, qualifier: &Qualifier) -> Result<Vec<Row>> {
        (**self).execute_query(entity, qualifier)
    }

    fn execute_joined_query(
        &self,
        root: &EntityDescriptor,
        select: &JoinedSelect,
        qualifier: &Qualifier,
    ) -> Result<Vec<Row>> {
        (**self).execute_joined_query(root, select, qualifier)
    }

    fn execute_write(
        &self,
        kind: WriteKind,
        entity: &DbEntity,
        payload: &WritePayload,
    ) -> Result<WriteResult> {
        (**self).execute_write(kind, entity, payload)
    }
}
