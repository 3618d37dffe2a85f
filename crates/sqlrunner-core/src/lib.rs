//! Core types and traits for sqlrunner.
//!
//! This crate provides the engine-independent vocabulary of the query
//! execution core:
//!
//! - `Value` and `Row` for parameters and results
//! - `Error` with the runner's error taxonomy
//! - `NativeConnection` / `NativeStatement` / `Driver` contracts that each
//!   engine implements
//! - `StatementRequest` and read/write classification
//! - `Outcome` and `Cx` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod row;
pub mod statement;
pub mod value;

pub use connection::{
    Capabilities, ColumnMeta, Driver, DriverOptions, IsolationLevel, LOG_ENV_VAR, LoggingOptions,
    NativeConnection, NativeStatement, NestedTransactions,
};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, FlushError, QueryError,
    QueryErrorKind, QueryExecutionError, Result, TransactionError, TransactionErrorKind, TypeError,
};
pub use row::{ColumnInfo, Row};
pub use statement::{INSERT_VERBS, READ_VERB, StatementKind, StatementRequest, command_keyword};
pub use value::Value;
