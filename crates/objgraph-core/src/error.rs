//! Error types for object graph operations.

use std::fmt;

/// The primary error type for all objgraph operations.
#[derive(Debug)]
pub enum Error {
    /// A HOLLOW object's backing row no longer exists.
    FaultResolution(FaultError),
    /// Operation addressed to an unknown, closed or expired session.
    Session(SessionError),
    /// A prefetch path does not exist on the entity graph.
    Path(PathError),
    /// An UPDATE or DELETE qualified by an identity key matched nothing.
    Conflict(ConflictError),
    /// Failure delegated from the query collaborator.
    Query(QueryError),
    /// Invalid entity or relationship metadata.
    Schema(SchemaError),
    /// Illegal lifecycle transition or object not owned by the session.
    State(StateError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct FaultError {
    pub entity: String,
    pub key: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub session_id: Option<u64>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// No session with this id was ever registered
    Unknown,
    /// The session was closed
    Expired,
    /// A session with this id already exists
    Duplicate,
    /// The registry has been shut down
    RegistryShutDown,
}

#[derive(Debug, Clone)]
pub struct PathError {
    pub kind: PathErrorKind,
    /// Entity the path is rooted at.
    pub root: String,
    /// The full path as requested.
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathErrorKind {
    /// Path or one of its segments is empty
    EmptySegment,
    /// Segment is not a valid relationship name
    InvalidSegment,
    /// Segment names no relationship of the entity reached so far
    UnknownRelationship,
}

#[derive(Debug, Clone)]
pub struct ConflictError {
    pub statement: &'static str,
    pub entity: String,
    pub key: String,
    pub affected: u64,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    pub entity: Option<String>,
    pub key: Option<String>,
    pub path: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Statement or round trip timed out
    Timeout,
    /// Connection lost during operation
    Disconnected,
    /// Cancelled by the caller
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug, Clone)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Entity not found
    UnknownEntity,
    /// Column or attribute not found
    UnknownColumn,
    /// Relationship not found
    UnknownRelationship,
    /// Invalid definition (empty joins, broken flattened chain, ...)
    Invalid,
}

#[derive(Debug, Clone)]
pub struct StateError {
    pub kind: StateErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    /// Transition not allowed from the current state
    IllegalTransition,
    /// Object handle is not registered in this session
    NotRegistered,
    /// Relationship used with the wrong arity (to-one vs to-many)
    WrongArity,
}

impl Error {
    /// Is this a retryable error (timeouts, lost connections)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Timeout | QueryErrorKind::Disconnected
            ),
            _ => false,
        }
    }

    /// Does this error mean the caller holds a reference to a row that is gone?
    pub fn is_stale_reference(&self) -> bool {
        matches!(self, Error::FaultResolution(_) | Error::Conflict(_))
    }

    /// Shorthand for a [`SchemaError`].
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for a [`StateError`].
    pub fn state(kind: StateErrorKind, message: impl Into<String>) -> Self {
        Error::State(StateError {
            kind,
            message: message.into(),
        })
    }
}

impl QueryError {
    /// Create a query error of the given kind.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            entity: None,
            key: None,
            path: None,
            source: None,
        }
    }

    /// Attach the entity the failing operation addressed.
    #[must_use]
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Attach the identity key the failing operation addressed.
    #[must_use]
    pub fn with_key(mut self, key: impl fmt::Display) -> Self {
        self.key = Some(key.to_string());
        self
    }

    /// Attach the prefetch path being resolved.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach the underlying driver error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// Fill in missing context on a collaborator failure without discarding what it already has.
pub fn with_query_context(
    err: Error,
    entity: &str,
    key: Option<&dyn fmt::Display>,
    path: Option<&str>,
) -> Error {
    match err {
        Error::Query(mut q) => {
            if q.entity.is_none() {
                q.entity = Some(entity.to_string());
            }
            if q.key.is_none() {
                q.key = key.map(ToString::to_string);
            }
            if q.path.is_none() {
                q.path = path.map(str::to_string);
            }
            Error::Query(q)
        }
        other => other,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FaultResolution(e) => write!(f, "Fault resolution failed: {}", e),
            Error::Session(e) => write!(f, "Session error: {}", e),
            Error::Path(e) => write!(f, "Malformed prefetch path: {}", e),
            Error::Conflict(e) => write!(f, "Optimistic lock failure: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::State(e) => write!(f, "State error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.entity, self.key, self.message)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.session_id {
            Some(id) => write!(f, "session {}: {}", id, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' from {}: {}", self.path, self.root, self.message)
    }
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} {} affected {} rows, expected 1",
            self.statement, self.entity, self.key, self.affected
        )
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(entity) = &self.entity {
            write!(f, " (entity {}", entity)?;
            if let Some(key) = &self.key {
                write!(f, ", key {}", key)?;
            }
            if let Some(path) = &self.path {
                write!(f, ", path '{}'", path)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl From<FaultError> for Error {
    fn from(err: FaultError) -> Self {
        Error::FaultResolution(err)
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        Error::Session(err)
    }
}

impl From<PathError> for Error {
    fn from(err: PathError) -> Self {
        Error::Path(err)
    }
}

impl From<ConflictError> for Error {
    fn from(err: ConflictError) -> Self {
        Error::Conflict(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::State(err)
    }
}

/// Result type alias for objgraph operations.
pub type Result<T> = std::result::Result<T, Error>;
