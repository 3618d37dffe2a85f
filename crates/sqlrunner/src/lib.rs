//! Query-execution core.
//!
//! `sqlrunner` turns an open native connection handle into a session that
//! executes statements, coordinates nested transactions, publishes
//! lifecycle events and flushes memory-resident engines at the right
//! checkpoints.
//!
//! # Example
//!
//! ```ignore
//! use sqlrunner::{Broadcaster, EventKind, QueryRunner};
//!
//! let broadcaster = Broadcaster::new();
//! broadcaster.subscribe(EventKind::AfterQuery, |event| {
//!     tracing::debug!(?event, "statement settled");
//!     None
//! });
//!
//! let mut runner = QueryRunner::new(driver, handle, broadcaster);
//! runner.begin_transaction(&cx, None).await;
//! runner.query(&cx, "INSERT INTO t VALUES (?)", &[Value::Int(1)]).await;
//! runner.commit_transaction(&cx).await; // flushes
//! runner.release(&cx).await;
//! ```

pub mod broadcaster;
pub mod dirty;
pub mod logger;
pub mod result;
pub mod runner;
pub mod transaction;

pub use broadcaster::{
    AfterQueryEvent, BroadcastReport, BroadcastResult, Broadcaster, DeferredWork, Event,
    EventKind, FAILURE_HISTORY, QueryEvent, SubscriberFailure, SubscriptionHandle, defer,
};
pub use dirty::DirtyTracker;
pub use logger::{QueryLogger, TracingQueryLogger};
pub use result::{QueryOutput, QueryResult};
pub use runner::QueryRunner;
pub use transaction::{NativeAction, Plan, TransactionCoordinator, Transition, savepoint_name};

pub use sqlrunner_core::{
    Capabilities, ColumnMeta, Cx, Driver, DriverOptions, Error, IsolationLevel, LoggingOptions,
    NativeConnection, NativeStatement, NestedTransactions, Outcome, Row, StatementKind,
    StatementRequest, Value,
};
