//! The SQLite driver facade.
//!
//! One [`SqliteDriver`] owns one native connection and hands it out to a
//! single [`QueryRunner`] at a time. In-memory databases are persisted on
//! flush through the configured auto-save target.

use crate::connection::{SqliteConfig, SqliteConnection, SqliteStatement};
use crate::types;
use sqlrunner::{Broadcaster, QueryRunner};
use sqlrunner_core::{
    Capabilities, ColumnMeta, ConnectionError, ConnectionErrorKind, Cx, Driver, DriverOptions,
    Error, IsolationLevel, NativeConnection, Outcome, Result, Value,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const BEFORE_MIGRATION: &[&str] = &["PRAGMA foreign_keys = OFF"];
const AFTER_MIGRATION: &[&str] = &["PRAGMA foreign_keys = ON"];

/// The native handle owned by a SQLite query runner.
#[derive(Debug)]
pub struct SqliteHandle {
    conn: Arc<SqliteConnection>,
}

impl SqliteHandle {
    pub fn connection(&self) -> &SqliteConnection {
        &self.conn
    }
}

impl NativeConnection for SqliteHandle {
    type Statement<'conn> = SqliteStatement<'conn>;

    fn prepare(&mut self, sql: &str) -> Result<SqliteStatement<'_>> {
        self.conn.prepare(sql)
    }

    fn modified_row_count(&self) -> u64 {
        self.conn.changes()
    }

    fn last_insert_id(&self) -> Option<i64> {
        match self.conn.last_insert_rowid() {
            0 => None,
            id => Some(id),
        }
    }

    fn begin(&mut self, isolation: Option<IsolationLevel>) -> Result<()> {
        self.conn.begin(isolation)
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn.rollback()
    }

    fn savepoint(&mut self, name: &str) -> Result<()> {
        self.conn.savepoint(name)
    }

    fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.conn.release_savepoint(name)
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.conn.rollback_to_savepoint(name)
    }
}

/// SQLite driver.
#[derive(Debug)]
pub struct SqliteDriver {
    conn: Arc<SqliteConnection>,
    config: SqliteConfig,
    broadcaster: Broadcaster,
    checked_out: AtomicBool,
}

impl SqliteDriver {
    /// Open the database described by `config`.
    ///
    /// An in-memory database with an existing `auto_save_location` starts
    /// from the contents of that file.
    pub fn open(config: SqliteConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let conn = SqliteConnection::open(&config)?;

        if config.is_memory() {
            if let Some(location) = config.auto_save_location.as_deref() {
                if location.exists() {
                    conn.restore_from(location)?;
                }
            }
        }

        Ok(Arc::new(Self {
            conn: Arc::new(conn),
            config,
            broadcaster: Broadcaster::new(),
            checked_out: AtomicBool::new(false),
        }))
    }

    /// Open a private in-memory database with default options.
    pub fn open_memory() -> Result<Arc<Self>> {
        Self::open(SqliteConfig::memory())
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    /// Event broadcaster shared by every runner of this driver.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn connection(&self) -> &SqliteConnection {
        &self.conn
    }

    /// Whether a query runner currently owns the connection.
    pub fn is_checked_out(&self) -> bool {
        self.checked_out.load(Ordering::Acquire)
    }

    /// Create the query runner that owns the connection.
    ///
    /// SQLite allows one writer, so a second runner is refused until the
    /// first one is released or dropped.
    pub fn create_query_runner(self: &Arc<Self>) -> Result<QueryRunner<Self>> {
        if self
            .checked_out
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Busy,
                message: "the sqlite connection is already owned by a query runner".to_string(),
                source: None,
            }));
        }

        let handle = SqliteHandle {
            conn: Arc::clone(&self.conn),
        };
        tracing::debug!(path = %self.conn.path(), "Created SQLite query runner");
        Ok(QueryRunner::new(
            Arc::clone(self),
            handle,
            self.broadcaster.clone(),
        ))
    }

    /// Write the database to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.conn.backup_to(path.as_ref())
    }

    /// The database file contents as bytes.
    pub fn export(&self) -> Result<Vec<u8>> {
        self.conn.serialize()
    }

    /// Persist an in-memory database to its auto-save target.
    ///
    /// Does nothing for file databases or when auto-save is off. The
    /// callback, when set, takes precedence over the file location.
    pub fn auto_save(&self) -> Result<()> {
        if !self.config.is_memory() || !self.config.auto_save {
            return Ok(());
        }
        if let Some(callback) = &self.config.auto_save_callback {
            let bytes = self.export()?;
            tracing::debug!(bytes = bytes.len(), "Auto-saving SQLite database to callback");
            return callback(bytes);
        }
        if let Some(location) = &self.config.auto_save_location {
            return self.save(location);
        }
        Ok(())
    }
}

impl Driver for SqliteDriver {
    type Handle = SqliteHandle;

    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> Capabilities {
        if self.config.is_memory() {
            Capabilities::in_memory()
        } else {
            Capabilities::default()
        }
    }

    fn options(&self) -> &DriverOptions {
        &self.config.options
    }

    fn coerce(&self, column: &ColumnMeta, value: Value) -> Value {
        types::coerce(column, value)
    }

    fn persist(
        &self,
        cx: &Cx,
        handle: &mut SqliteHandle,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let _ = handle;
        let result = match cx.cancel_reason() {
            Some(reason) => Outcome::Cancelled(reason),
            None => self.auto_save().map_or_else(Outcome::Err, Outcome::Ok),
        };
        async move { result }
    }

    fn before_migration_sql(&self) -> &'static [&'static str] {
        BEFORE_MIGRATION
    }

    fn after_migration_sql(&self) -> &'static [&'static str] {
        AFTER_MIGRATION
    }

    fn release_handle(&self, handle: SqliteHandle) {
        drop(handle);
        self.checked_out.store(false, Ordering::Release);
        tracing::debug!(path = %self.conn.path(), "Released SQLite query runner");
    }
}
