//! Error types for query execution.
//!
//! Errors fall into two layers. Native errors (`Query`, `Connection`, `Io`)
//! are what an engine reports. The query runner never surfaces them raw: it
//! wraps them with execution context into `QueryExecution`, `Transaction` or
//! `Flush` before they reach a caller.

use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// The primary error type for all query-runner operations.
#[derive(Debug)]
pub enum Error {
    /// Operation attempted on a session that was already released
    SessionReleased,
    /// Statement execution failed; carries the statement, parameters and cause
    QueryExecution(QueryExecutionError),
    /// Commit or rollback issued while no transaction is open
    NoActiveTransaction,
    /// A native transaction primitive failed
    Transaction(TransactionError),
    /// Persisting in-memory state failed; the session stays dirty
    Flush(FlushError),
    /// Native engine error (prepare, bind, step)
    Query(QueryError),
    /// Connection-level errors (open, acquire, lost handle)
    Connection(ConnectionError),
    /// Type conversion errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Deferred subscriber work failed
    Subscriber(String),
}

/// A statement failed to execute.
///
/// The cause is shared so the same failure can be handed to `AfterQuery`
/// subscribers and returned to the caller.
#[derive(Debug)]
pub struct QueryExecutionError {
    pub sql: String,
    pub params: Vec<Value>,
    pub cause: Arc<Error>,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub code: Option<i32>,
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
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Engine busy or locked
    Busy,
    /// Parameter binding failed
    Bind,
    /// Interrupted
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the engine
    Connect,
    /// The driver's single handle is already checked out
    Busy,
    /// Handle lost during operation
    Disconnected,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Native BEGIN failed
    Begin,
    /// Native COMMIT or savepoint release failed
    Commit,
    /// Native ROLLBACK or rollback-to-savepoint failed
    Rollback,
    /// Nested transaction requested on an engine without savepoints
    NestedNotSupported,
}

#[derive(Debug)]
pub struct FlushError {
    pub message: String,
    pub cause: Box<Error>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a native query error without SQL context.
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            sql: None,
            code: None,
            message: message.into(),
            source: None,
        })
    }

    /// Is this a retryable error (busy engine, handle checked out)?
    ///
    /// The runner itself never retries; this is advice for callers.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Busy),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::Busy),
            Error::QueryExecution(e) => e.cause.is_retryable(),
            Error::Flush(_) => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires a new handle?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect | ConnectionErrorKind::Disconnected
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Get the SQL that caused this error, if available.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::QueryExecution(e) => Some(&e.sql),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a constraint violation?
    pub fn is_constraint_violation(&self) -> bool {
        self.kind == QueryErrorKind::Constraint
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SessionReleased => {
                write!(f, "Query runner already released; cannot run queries anymore")
            }
            Error::QueryExecution(e) => write!(f, "Query failed: {}", e),
            Error::NoActiveTransaction => write!(f, "Transaction is not started yet"),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e),
            Error::Flush(e) => write!(f, "Flush error: {}", e),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Subscriber(msg) => write!(f, "Subscriber error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::QueryExecution(e) => Some(e.cause.as_ref()),
            Error::Transaction(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Flush(e) => Some(e.cause.as_ref()),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for QueryExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (statement: {}", self.cause, self.sql)?;
        if !self.params.is_empty() {
            write!(f, ", parameters: {:?}", self.params)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.message, self.cause)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<FlushError> for Error {
    fn from(err: FlushError) -> Self {
        Error::Flush(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for synchronous native operations.
pub type Result<T> = std::result::Result<T, Error>;
