//! Query logging.
//!
//! A [`QueryLogger`] receives every statement, every failure and every slow
//! statement. The default [`TracingQueryLogger`] forwards to `tracing`,
//! filtered by [`LoggingOptions`] (see `SQLRUNNER_LOG`).

use sqlrunner_core::{Error, LoggingOptions, Value};
use std::time::Duration;

/// Sink for statement diagnostics.
pub trait QueryLogger: Send + Sync {
    /// A statement is about to run.
    fn log_query(&self, sql: &str, params: &[Value]);

    /// A statement failed.
    fn log_query_error(&self, error: &Error, sql: &str, params: &[Value]);

    /// A statement took longer than the configured threshold.
    fn log_query_slow(&self, elapsed: Duration, sql: &str, params: &[Value]);
}

/// Logs through `tracing` with per-category switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingQueryLogger {
    options: LoggingOptions,
}

impl TracingQueryLogger {
    pub fn new(options: LoggingOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> LoggingOptions {
        self.options
    }
}

impl QueryLogger for TracingQueryLogger {
    fn log_query(&self, sql: &str, params: &[Value]) {
        if self.options.queries {
            tracing::info!(sql = %sql, params = ?params, "query");
        }
    }

    fn log_query_error(&self, error: &Error, sql: &str, params: &[Value]) {
        if self.options.errors {
            tracing::error!(sql = %sql, params = ?params, error = %error, "query failed");
        }
    }

    fn log_query_slow(&self, elapsed: Duration, sql: &str, params: &[Value]) {
        if self.options.slow {
            tracing::warn!(
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                sql = %sql,
                params = ?params,
                "query is slow"
            );
        }
    }
}
