//! SQLite connection implementation.
//!
//! Safe wrappers around SQLite's C API: opening, preparing and stepping
//! statements, the native transaction primitives, and whole-database
//! copies (backup to a file, restore from a file, serialize to bytes).

// Allow casts in FFI code where we need to match C types exactly
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::result_large_err)]
#![allow(clippy::borrow_as_ptr)]

use crate::ffi;
use crate::types;
use sqlrunner_core::{
    ColumnMeta, ConfigError, ConnectionError, ConnectionErrorKind, DriverOptions, Error,
    IsolationLevel, NativeStatement, QueryError, QueryErrorKind, Result, Value,
};
use std::ffi::{CString, c_int};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Receives the serialized database on every auto-save.
pub type AutoSaveCallback = Arc<dyn Fn(Vec<u8>) -> Result<()> + Send + Sync>;

/// Path that selects a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

/// Configuration for opening a SQLite driver.
#[derive(Clone)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:" for an in-memory database.
    pub path: String,
    /// Open flags (read-only, read-write, create, etc.)
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Persist the in-memory database on every flush.
    pub auto_save: bool,
    /// File the in-memory database is loaded from and auto-saved to.
    pub auto_save_location: Option<PathBuf>,
    /// Receives the database bytes instead of writing `auto_save_location`.
    pub auto_save_callback: Option<AutoSaveCallback>,
    /// Options handed to every query runner.
    pub options: DriverOptions,
}

impl fmt::Debug for SqliteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConfig")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .field("auto_save", &self.auto_save)
            .field("auto_save_location", &self.auto_save_location)
            .field("auto_save_callback", &self.auto_save_callback.is_some())
            .field("options", &self.options)
            .finish()
    }
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Open for reading only.
    pub read_only: bool,
    /// Open for reading and writing.
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
    /// Open in multi-thread mode.
    pub no_mutex: bool,
    /// Open in serialized mode.
    pub full_mutex: bool,
    /// Enable shared cache mode.
    pub shared_cache: bool,
    /// Disable shared cache mode.
    pub private_cache: bool,
}

impl OpenFlags {
    /// Create flags for read-only access.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access with creation if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;

        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if self.no_mutex {
            flags |= ffi::SQLITE_OPEN_NOMUTEX;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }
        if self.shared_cache {
            flags |= ffi::SQLITE_OPEN_SHAREDCACHE;
        }
        if self.private_cache {
            flags |= ffi::SQLITE_OPEN_PRIVATECACHE;
        }

        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }

        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: MEMORY_PATH.to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            auto_save: false,
            auto_save_location: None,
            auto_save_callback: None,
            options: DriverOptions::default(),
        }
    }
}

impl SqliteConfig {
    /// Config for a file-based database (write-through, nothing to flush).
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Whether the database lives in memory and needs explicit persistence.
    pub fn is_memory(&self) -> bool {
        self.path == MEMORY_PATH
    }

    /// Set open flags.
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set busy timeout.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    /// Auto-save to a file on every flush; the file is also loaded on open.
    pub fn auto_save_to(mut self, location: impl Into<PathBuf>) -> Self {
        self.auto_save = true;
        self.auto_save_location = Some(location.into());
        self
    }

    /// Auto-save by handing the database bytes to a callback.
    pub fn auto_save_with<F>(mut self, callback: F) -> Self
    where
        F: Fn(Vec<u8>) -> Result<()> + Send + Sync + 'static,
    {
        self.auto_save = true;
        self.auto_save_callback = Some(Arc::new(callback));
        self
    }

    /// Load from `location` on open without enabling auto-save.
    pub fn location(mut self, location: impl Into<PathBuf>) -> Self {
        self.auto_save_location = Some(location.into());
        self
    }

    /// Set driver options.
    pub fn options(mut self, options: DriverOptions) -> Self {
        self.options = options;
        self
    }

    /// Reject combinations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.auto_save && self.auto_save_location.is_none() && self.auto_save_callback.is_none()
        {
            return Err(Error::Config(ConfigError {
                message: "auto_save needs an auto_save_location or an auto_save_callback"
                    .to_string(),
                source: None,
            }));
        }
        Ok(())
    }
}

/// Inner state of the SQLite connection, protected by a mutex.
pub(crate) struct SqliteInner {
    db: *mut ffi::sqlite3,
}

// SAFETY: the raw handle is only touched while the mutex is held.
unsafe impl Send for SqliteInner {}

/// A connection to a SQLite database.
pub struct SqliteConnection {
    inner: Mutex<SqliteInner>,
    path: String,
}

// SqliteConnection is Send + Sync because all access goes through the Mutex
unsafe impl Send for SqliteConnection {}
unsafe impl Sync for SqliteConnection {}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteConnection {
    /// Open a new SQLite connection with the given configuration.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let db = open_db(&config.path, config.flags.to_sqlite_flags())?;

        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms as c_int);
            }
        }

        tracing::debug!(path = %config.path, "Opened SQLite database");
        Ok(Self {
            inner: Mutex::new(SqliteInner { db }),
            path: config.path.clone(),
        })
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    /// Get the database path.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute SQL directly without preparing (for DDL, transaction control).
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let inner = self.lock();
        exec(inner.db, sql)
    }

    /// Get the last insert rowid.
    pub fn last_insert_rowid(&self) -> i64 {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_last_insert_rowid(inner.db) }
    }

    /// Get the number of rows changed by the last statement.
    pub fn changes(&self) -> u64 {
        let inner = self.lock();
        // SAFETY: db is valid
        let changes = unsafe { ffi::sqlite3_changes(inner.db) };
        changes.max(0) as u64
    }

    /// Prepare a statement. The connection stays locked until the statement
    /// is dropped.
    pub fn prepare(&self, sql: &str) -> Result<SqliteStatement<'_>> {
        let guard = self.lock();
        let stmt = prepare_stmt(guard.db, sql)?;
        // SAFETY: stmt was just prepared
        let columns = unsafe { types::columns(stmt) };
        Ok(SqliteStatement {
            guard,
            stmt,
            sql: sql.to_string(),
            columns,
            done: false,
        })
    }

    /// Begin a transaction.
    ///
    /// SQLite has no isolation levels; they map onto the locking mode.
    pub fn begin(&self, isolation: Option<IsolationLevel>) -> Result<()> {
        let begin_sql = match isolation {
            None => "BEGIN",
            Some(IsolationLevel::Serializable) => "BEGIN EXCLUSIVE",
            Some(IsolationLevel::RepeatableRead | IsolationLevel::ReadCommitted) => {
                "BEGIN IMMEDIATE"
            }
            Some(IsolationLevel::ReadUncommitted) => "BEGIN DEFERRED",
        };
        self.execute_raw(begin_sql)
    }

    pub fn commit(&self) -> Result<()> {
        self.execute_raw("COMMIT")
    }

    pub fn rollback(&self) -> Result<()> {
        self.execute_raw("ROLLBACK")
    }

    pub fn savepoint(&self, name: &str) -> Result<()> {
        self.execute_raw(&format!("SAVEPOINT {}", name))
    }

    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        self.execute_raw(&format!("RELEASE {}", name))
    }

    /// Roll back to a savepoint and drop it, closing that nesting level.
    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.execute_raw(&format!("ROLLBACK TO {name}; RELEASE {name}"))
    }

    /// Whether the connection is in autocommit mode (no open transaction).
    pub fn is_autocommit(&self) -> bool {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_get_autocommit(inner.db) != 0 }
    }

    /// Copy the whole database into `path`.
    ///
    /// The copy goes to a sibling temporary file first and is renamed into
    /// place, so readers never observe a half-written file.
    pub fn backup_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let dest = open_db(
                &path_str(&tmp)?,
                ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE,
            )?;
            let inner = self.lock();
            let copied = copy_database(dest, inner.db);
            // SAFETY: dest was opened above and is not used afterwards
            unsafe { ffi::sqlite3_close(dest) };
            if let Err(e) = copied {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
        }

        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), "Saved SQLite database");
        Ok(())
    }

    /// Replace the database contents with the database stored at `path`.
    pub fn restore_from(&self, path: &Path) -> Result<()> {
        let source = open_db(&path_str(path)?, ffi::SQLITE_OPEN_READONLY)?;
        let inner = self.lock();
        let copied = copy_database(inner.db, source);
        // SAFETY: source was opened above and is not used afterwards
        unsafe { ffi::sqlite3_close(source) };
        copied?;
        tracing::debug!(path = %path.display(), "Loaded SQLite database");
        Ok(())
    }

    /// Serialize the main database to bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let inner = self.lock();
        let schema = c"main";
        let mut size: ffi::sqlite3_int64 = 0;
        // SAFETY: db is valid; the returned buffer is owned by us and freed below
        let data = unsafe { ffi::sqlite3_serialize(inner.db, schema.as_ptr(), &mut size, 0) };
        if data.is_null() {
            // An empty database serializes to nothing.
            if size == 0 {
                return Ok(Vec::new());
            }
            return Err(database_error(inner.db, None));
        }
        // SAFETY: sqlite3_serialize returned `size` readable bytes at `data`
        let bytes = unsafe { std::slice::from_raw_parts(data, size as usize).to_vec() };
        // SAFETY: data was allocated by SQLite
        unsafe { ffi::sqlite3_free(data.cast()) };
        Ok(bytes)
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let inner = self.lock();
        if !inner.db.is_null() {
            // SAFETY: db is valid and no statement outlives the connection
            unsafe {
                ffi::sqlite3_close_v2(inner.db);
            }
        }
    }
}

/// A prepared statement holding the connection lock.
///
/// The statement is finalized when dropped, on every exit path.
pub struct SqliteStatement<'conn> {
    guard: MutexGuard<'conn, SqliteInner>,
    stmt: *mut ffi::sqlite3_stmt,
    sql: String,
    columns: Vec<ColumnMeta>,
    done: bool,
}

impl SqliteStatement<'_> {
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl NativeStatement for SqliteStatement<'_> {
    fn bind(&mut self, params: &[Value]) -> Result<()> {
        for (i, param) in params.iter().enumerate() {
            // SAFETY: stmt is valid, index is 1-based
            let rc = unsafe { types::bind_value(self.stmt, (i + 1) as c_int, param) };
            if rc != ffi::SQLITE_OK {
                return Err(bind_error(self.guard.db, &self.sql, i + 1));
            }
        }
        Ok(())
    }

    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        if self.done {
            return Ok(None);
        }
        // SAFETY: stmt is valid
        let rc = unsafe { ffi::sqlite3_step(self.stmt) };
        match rc {
            ffi::SQLITE_ROW => {
                let values = (0..self.columns.len())
                    // SAFETY: we just got SQLITE_ROW and i < column count
                    .map(|i| unsafe { types::read_column(self.stmt, i as c_int) })
                    .collect();
                Ok(Some(values))
            }
            ffi::SQLITE_DONE => {
                self.done = true;
                Ok(None)
            }
            _ => {
                self.done = true;
                Err(database_error(self.guard.db, Some(&self.sql)))
            }
        }
    }
}

impl Drop for SqliteStatement<'_> {
    fn drop(&mut self) {
        // SAFETY: stmt is valid and finalized exactly once
        unsafe { ffi::sqlite3_finalize(self.stmt) };
    }
}

// Helper functions

fn path_str(path: &Path) -> Result<String> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: format!("Invalid path: {} is not valid UTF-8", path.display()),
            source: None,
        })
    })
}

fn open_db(path: &str, flags: c_int) -> Result<*mut ffi::sqlite3> {
    let c_path = CString::new(path).map_err(|_| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: "Invalid path: contains null byte".to_string(),
            source: None,
        })
    })?;

    let mut db: *mut ffi::sqlite3 = ptr::null_mut();
    // SAFETY: We pass valid pointers and check the return value
    let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

    if rc != ffi::SQLITE_OK {
        let msg = if db.is_null() {
            ffi::error_string(rc).to_string()
        } else {
            // SAFETY: db is valid until closed here
            unsafe {
                let msg = ffi::last_error_message(db);
                ffi::sqlite3_close(db);
                msg
            }
        };

        return Err(Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: format!("Failed to open database {}: {}", path, msg),
            source: None,
        }));
    }

    Ok(db)
}

fn copy_database(dest: *mut ffi::sqlite3, source: *mut ffi::sqlite3) -> Result<()> {
    let main = c"main";
    // SAFETY: both handles are valid; names are NUL-terminated
    let backup = unsafe { ffi::sqlite3_backup_init(dest, main.as_ptr(), source, main.as_ptr()) };
    if backup.is_null() {
        return Err(database_error(dest, None));
    }
    // SAFETY: backup is valid; -1 copies every page in one step
    let rc = unsafe { ffi::sqlite3_backup_step(backup, -1) };
    // SAFETY: backup is valid and finished exactly once
    let finish = unsafe { ffi::sqlite3_backup_finish(backup) };
    if rc != ffi::SQLITE_DONE || finish != ffi::SQLITE_OK {
        return Err(database_error(dest, None));
    }
    Ok(())
}

fn exec(db: *mut ffi::sqlite3, sql: &str) -> Result<()> {
    let c_sql = CString::new(sql).map_err(|_| null_byte_error(sql))?;
    let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe { ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg) };

    if rc != ffi::SQLITE_OK {
        let message = if errmsg.is_null() {
            ffi::error_string(rc).to_string()
        } else {
            // SAFETY: errmsg is a valid C string allocated by SQLite
            let msg = unsafe { std::ffi::CStr::from_ptr(errmsg).to_string_lossy().into_owned() };
            unsafe { ffi::sqlite3_free(errmsg.cast()) };
            msg
        };

        return Err(Error::Query(QueryError {
            kind: error_code_to_kind(rc),
            sql: Some(sql.to_string()),
            code: Some(rc),
            message,
            source: None,
        }));
    }

    Ok(())
}

fn prepare_stmt(db: *mut ffi::sqlite3, sql: &str) -> Result<*mut ffi::sqlite3_stmt> {
    let c_sql = CString::new(sql).map_err(|_| null_byte_error(sql))?;
    let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe {
        ffi::sqlite3_prepare_v2(
            db,
            c_sql.as_ptr(),
            c_sql.as_bytes().len() as c_int,
            &mut stmt,
            ptr::null_mut(),
        )
    };

    if rc != ffi::SQLITE_OK {
        return Err(database_error(db, Some(sql)));
    }
    if stmt.is_null() {
        // Whitespace or comment only
        return Err(Error::Query(QueryError {
            kind: QueryErrorKind::Syntax,
            sql: Some(sql.to_string()),
            code: None,
            message: "statement is empty".to_string(),
            source: None,
        }));
    }

    Ok(stmt)
}

fn null_byte_error(sql: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(sql.to_string()),
        code: None,
        message: "SQL contains null byte".to_string(),
        source: None,
    })
}

fn database_error(db: *mut ffi::sqlite3, sql: Option<&str>) -> Error {
    // SAFETY: db is valid
    let (message, code) = unsafe { (ffi::last_error_message(db), ffi::sqlite3_errcode(db)) };

    Error::Query(QueryError {
        kind: error_code_to_kind(code),
        sql: sql.map(str::to_string),
        code: Some(code),
        message,
        source: None,
    })
}

fn bind_error(db: *mut ffi::sqlite3, sql: &str, param_index: usize) -> Error {
    // SAFETY: db is valid
    let msg = unsafe { ffi::last_error_message(db) };

    Error::Query(QueryError {
        kind: QueryErrorKind::Bind,
        sql: Some(sql.to_string()),
        code: None,
        message: format!("Failed to bind parameter {}: {}", param_index, msg),
        source: None,
    })
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    // Extended codes carry the primary code in the low byte.
    match code & 0xff {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Busy,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH => QueryErrorKind::Permission,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        ffi::SQLITE_TOOBIG => QueryErrorKind::DataTruncation,
        ffi::SQLITE_INTERRUPT => QueryErrorKind::Cancelled,
        ffi::SQLITE_ERROR => QueryErrorKind::Syntax,
        _ => QueryErrorKind::Database,
    }
}
