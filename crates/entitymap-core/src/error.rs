//! Error types for entitymap operations.

use std::fmt;

/// The primary error type for all entitymap operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, lost connection)
    Connection(ConnectionError),
    /// Statement execution errors reported by the driver
    Query(QueryError),
    /// Transaction errors (begin/commit/rollback)
    Transaction(TransactionError),
    /// Mapping metadata is missing or inconsistent
    Mapping(MappingError),
    /// Entity lifecycle violations raised by the unit of work
    Lifecycle(LifecycleError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// No connection registered under the requested store name
    UnknownStore,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
    /// Stores that had already committed when the failure happened.
    pub committed: Vec<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransactionError {
    pub fn new(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            committed: Vec::new(),
            source: None,
        }
    }

    /// `store` refused to commit after every store in `committed` had.
    pub fn partial_commit(store: &str, committed: Vec<String>, cause: Error) -> Self {
        Self {
            kind: TransactionErrorKind::PartialCommit,
            message: format!(
                "store '{store}' refused to commit after {} committed: {cause}",
                committed.join(", ")
            ),
            committed,
            source: Some(Box::new(cause)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Could not open a transaction
    Begin,
    /// Commit was refused by the store
    Commit,
    /// Rollback failed
    Rollback,
    /// A store refused to commit after other stores already had; see
    /// [`TransactionError::committed`]
    PartialCommit,
}

/// Mapping metadata problem: unknown entity, relation or column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingError {
    pub entity: String,
    pub message: String,
}

/// An entity lifecycle rule was broken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleError {
    pub kind: LifecycleErrorKind,
    /// Entity type the offending instance belongs to
    pub entity: String,
    /// Relation property involved, if any
    pub property: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleErrorKind {
    /// State change not allowed from the entity's current state
    InvalidStateTransition,
    /// Related entity is unpersisted and the relation does not cascade persist
    UncascadedRelation,
    /// Related entity is scheduled for deletion
    DeletedRelationTarget,
}

impl LifecycleError {
    pub fn invalid_transition(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: LifecycleErrorKind::InvalidStateTransition,
            entity: entity.into(),
            property: None,
            message: message.into(),
        }
    }

    pub fn uncascaded(entity: impl Into<String>, property: impl Into<String>) -> Self {
        let entity = entity.into();
        let property = property.into();
        let message = format!(
            "relation '{entity}.{property}' points to an unpersisted entity and does not cascade persist"
        );
        Self {
            kind: LifecycleErrorKind::UncascadedRelation,
            entity,
            property: Some(property),
            message,
        }
    }

    pub fn deleted_target(entity: impl Into<String>, property: impl Into<String>) -> Self {
        let entity = entity.into();
        let property = property.into();
        let message =
            format!("relation '{entity}.{property}' points to an entity scheduled for deletion");
        Self {
            kind: LifecycleErrorKind::DeletedRelationTarget,
            entity,
            property: Some(property),
            message,
        }
    }
}

impl Error {
    /// Is this a failure reported by storage (driver, connection or transaction)?
    ///
    /// Storage failures abort a commit and are returned unchanged after rollback.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Query(_) | Error::Transaction(_)
        )
    }

    /// The lifecycle error kind, if this is a lifecycle violation.
    pub fn lifecycle_kind(&self) -> Option<LifecycleErrorKind> {
        match self {
            Error::Lifecycle(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    pub fn mapping(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            entity: entity.into(),
            message: message.into(),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Mapping(e) => write!(f, "Mapping error: {e}"),
            Error::Lifecycle(e) => write!(f, "Lifecycle error: {e}"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Transaction(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LifecycleError {}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<LifecycleError> for Error {
    fn from(err: LifecycleError) -> Self {
        Error::Lifecycle(err)
    }
}

/// Result type alias for entitymap operations.
pub type Result<T> = std::result::Result<T, Error>;
