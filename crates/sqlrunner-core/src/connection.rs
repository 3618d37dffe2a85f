//! Native connection and driver contracts.
//!
//! This module defines what the query runner consumes from an engine:
//!
//! - [`NativeConnection`] - an open handle that prepares statements, reports
//!   row counters and issues the native transaction primitives
//! - [`NativeStatement`] - a prepared statement, released when dropped
//! - [`Driver`] - the facade supplying capability flags, options, value
//!   coercion and the persistence primitive for memory-resident engines
//!
//! Engine differences are carried as data ([`Capabilities`]), never as a
//! type hierarchy of runners.

use crate::error::Result;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;
use std::time::Duration;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Transactions can see uncommitted changes from others.
    ReadUncommitted,

    /// Transactions only see committed changes from others.
    #[default]
    ReadCommitted,

    /// Transactions see a consistent snapshot of the database.
    RepeatableRead,

    /// Transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Metadata for one result column as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Column name (or alias)
    pub name: String,
    /// Declared type, when the engine knows it
    pub decl_type: Option<String>,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decl_type: None,
        }
    }

    #[must_use]
    pub fn with_decl_type(mut self, decl_type: impl Into<String>) -> Self {
        self.decl_type = Some(decl_type.into());
        self
    }

    /// Case-insensitive check of the declared type.
    pub fn is_declared(&self, ty: &str) -> bool {
        self.decl_type
            .as_deref()
            .is_some_and(|decl| decl.eq_ignore_ascii_case(ty))
    }
}

/// A prepared native statement.
///
/// Implementations release the engine resource in `Drop`, so a statement is
/// freed on every exit path, including errors raised while binding or
/// draining.
pub trait NativeStatement {
    /// Bind parameters in order. Absent values must already be `Value::Null`.
    fn bind(&mut self, params: &[Value]) -> Result<()>;

    /// Result column metadata (empty for statements that return no rows).
    fn columns(&self) -> &[ColumnMeta];

    /// Step the statement, returning the next row or `None` when done.
    fn next_row(&mut self) -> Result<Option<Vec<Value>>>;
}

/// An open native connection handle.
///
/// The handle is owned by exactly one query runner. Statement-level work is
/// synchronous: in-process engines do it on the calling thread, exactly like
/// `SqliteConnection` does behind its mutex.
pub trait NativeConnection: Send {
    /// The prepared statement type borrowed from this handle.
    type Statement<'conn>: NativeStatement
    where
        Self: 'conn;

    /// Prepare a statement.
    fn prepare(&mut self, sql: &str) -> Result<Self::Statement<'_>>;

    /// Rows modified by the most recently completed statement.
    fn modified_row_count(&self) -> u64;

    /// Identifier generated by the most recent insert, if the engine has one.
    ///
    /// The value may be stale; the runner only reports it for inserts that
    /// changed rows.
    fn last_insert_id(&self) -> Option<i64>;

    /// Start a native transaction.
    fn begin(&mut self, isolation: Option<IsolationLevel>) -> Result<()>;

    /// Commit the native transaction.
    fn commit(&mut self) -> Result<()>;

    /// Roll back the native transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Create a named savepoint.
    fn savepoint(&mut self, name: &str) -> Result<()>;

    /// Release a named savepoint, keeping its changes.
    fn release_savepoint(&mut self, name: &str) -> Result<()>;

    /// Roll back to a named savepoint, discarding changes made after it.
    fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;
}

/// What an engine can do natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// BEGIN/COMMIT/ROLLBACK exist at all
    pub supports_native_transactions: bool,
    /// SAVEPOINT/RELEASE/ROLLBACK TO exist (nested transactions)
    pub supports_savepoints: bool,
    /// Durable state is not synchronized by every write; flush is meaningful
    pub requires_flush: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_native_transactions: true,
            supports_savepoints: true,
            requires_flush: false,
        }
    }
}

impl Capabilities {
    /// An in-process engine whose state lives in memory until flushed.
    pub fn in_memory() -> Self {
        Self {
            requires_flush: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn savepoints(mut self, enabled: bool) -> Self {
        self.supports_savepoints = enabled;
        self
    }

    #[must_use]
    pub fn native_transactions(mut self, enabled: bool) -> Self {
        self.supports_native_transactions = enabled;
        self
    }
}

/// What to do with a nested `begin` on an engine without savepoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NestedTransactions {
    /// Track depth only; the outermost transaction governs atomicity.
    #[default]
    Flatten,
    /// Fail the nested `begin` with a transaction error.
    Reject,
}

/// Environment variable holding the query-logging categories.
pub const LOG_ENV_VAR: &str = "SQLRUNNER_LOG";

/// Which query-logging categories are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingOptions {
    /// Log every statement before it runs
    pub queries: bool,
    /// Log failed statements
    pub errors: bool,
    /// Log statements slower than the configured threshold
    pub slow: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            queries: false,
            errors: true,
            slow: true,
        }
    }
}

impl LoggingOptions {
    /// Everything on.
    pub fn all() -> Self {
        Self {
            queries: true,
            errors: true,
            slow: true,
        }
    }

    /// Everything off.
    pub fn none() -> Self {
        Self {
            queries: false,
            errors: false,
            slow: false,
        }
    }

    /// Parse a logging spec: `all`, `none`, or a comma list of
    /// `query`, `error`, `slow`. Unknown entries are ignored.
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim().to_lowercase();
        match spec.as_str() {
            "all" | "1" | "true" | "on" => return Self::all(),
            "none" | "0" | "false" | "off" | "" => return Self::none(),
            _ => {}
        }
        let mut options = Self::none();
        for part in spec.split(',').map(str::trim) {
            match part {
                "query" | "queries" => options.queries = true,
                "error" | "errors" => options.errors = true,
                "slow" => options.slow = true,
                _ => {}
            }
        }
        options
    }

    /// Read [`LOG_ENV_VAR`], falling back to the defaults when unset.
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(LOG_ENV_VAR).ok().as_deref())
    }

    /// Options for a possibly unset environment value.
    pub fn from_env_value(value: Option<&str>) -> Self {
        value.map_or_else(Self::default, Self::parse)
    }
}

/// Driver-level options consumed by the query runner.
///
/// The default logging categories come from [`LOG_ENV_VAR`].
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Statements slower than this emit a slow-query diagnostic.
    pub max_query_execution_time: Option<Duration>,
    /// Policy for nested transactions without savepoint support.
    pub nested_transactions: NestedTransactions,
    /// Query logging categories.
    pub logging: LoggingOptions,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            max_query_execution_time: None,
            nested_transactions: NestedTransactions::default(),
            logging: LoggingOptions::from_env(),
        }
    }
}

impl DriverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the slow-query threshold.
    #[must_use]
    pub fn max_query_execution_time(mut self, threshold: Duration) -> Self {
        self.max_query_execution_time = Some(threshold);
        self
    }

    #[must_use]
    pub fn nested_transactions(mut self, policy: NestedTransactions) -> Self {
        self.nested_transactions = policy;
        self
    }

    #[must_use]
    pub fn logging(mut self, logging: LoggingOptions) -> Self {
        self.logging = logging;
        self
    }
}

/// The engine facade a query runner is bound to.
pub trait Driver: Send + Sync + 'static {
    /// Native handle type handed to each runner.
    type Handle: NativeConnection;

    /// Short engine name used in diagnostics.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn options(&self) -> &DriverOptions;

    /// Engine-specific coercion applied to every value read from a row.
    fn coerce(&self, column: &ColumnMeta, value: Value) -> Value {
        let _ = column;
        value
    }

    /// Persist memory-resident state to durable storage.
    ///
    /// Engines with write-through durability return `Ok` without doing work.
    fn persist(
        &self,
        cx: &Cx,
        handle: &mut Self::Handle,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Statements run before a schema migration.
    fn before_migration_sql(&self) -> &'static [&'static str] {
        &[]
    }

    /// Statements run after a schema migration.
    fn after_migration_sql(&self) -> &'static [&'static str] {
        &[]
    }

    /// Take back a handle from a released (or dropped) runner.
    fn release_handle(&self, handle: Self::Handle) {
        drop(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_default() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
    }

    #[test]
    fn test_capabilities_builders() {
        let caps = Capabilities::in_memory().savepoints(false);
        assert!(caps.requires_flush);
        assert!(!caps.supports_savepoints);
        assert!(caps.supports_native_transactions);
        assert!(!Capabilities::default().requires_flush);
    }

    #[test]
    fn test_logging_options_parse() {
        assert_eq!(LoggingOptions::parse("all"), LoggingOptions::all());
        assert_eq!(LoggingOptions::parse("off"), LoggingOptions::none());

        let parsed = LoggingOptions::parse("Query, slow,bogus");
        assert!(parsed.queries);
        assert!(parsed.slow);
        assert!(!parsed.errors);
    }

    #[test]
    fn test_logging_options_from_env_value() {
        assert_eq!(LoggingOptions::from_env_value(None), LoggingOptions::default());
        assert_eq!(LoggingOptions::from_env_value(Some("all")), LoggingOptions::all());
        assert_eq!(LoggingOptions::from_env_value(Some("")), LoggingOptions::none());
        assert!(LoggingOptions::from_env_value(Some("query")).queries);
    }

    #[test]
    fn test_driver_options_default_reads_env() {
        assert_eq!(DriverOptions::default().logging, LoggingOptions::from_env());
        assert_eq!(DriverOptions::new().logging, LoggingOptions::from_env());
    }

    #[test]
    fn test_driver_options_builder() {
        let options = DriverOptions::new()
            .max_query_execution_time(Duration::from_millis(250))
            .nested_transactions(NestedTransactions::Reject)
            .logging(LoggingOptions::none());

        assert_eq!(
            options.max_query_execution_time,
            Some(Duration::from_millis(250))
        );
        assert_eq!(options.nested_transactions, NestedTransactions::Reject);
        assert_eq!(options.logging, LoggingOptions::none());
    }

    #[test]
    fn test_column_meta_declared_type() {
        let col = ColumnMeta::new("payload").with_decl_type("json");
        assert!(col.is_declared("JSON"));
        assert!(!ColumnMeta::new("x").is_declared("JSON"));
    }
}
