//! SQLite driver for sqlrunner.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! Binds the [`sqlrunner::QueryRunner`] to an embedded SQLite database via
//! libsqlite3. Databases are either file-backed (write-through) or held in
//! memory and persisted on flush to a file or an auto-save callback.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlrunner_sqlite::{SqliteConfig, SqliteDriver};
//! use sqlrunner_core::{Cx, Outcome, Value};
//!
//! let driver = SqliteDriver::open(SqliteConfig::memory().auto_save_to("app.sqlite"))?;
//! let mut runner = driver.create_query_runner()?;
//!
//! let cx = Cx::for_testing();
//! runner.query(&cx, "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", &[]).await;
//! runner.query(&cx, "INSERT INTO users (name) VALUES (?)", &[Value::Text("Alice".into())]).await;
//! // Writes app.sqlite
//! runner.release(&cx).await;
//! ```
//!
//! # Type Mapping
//!
//! | Value | SQLite storage |
//! |-------|----------------|
//! | `Bool` | INTEGER (0/1) |
//! | `Int`, `BigInt` | INTEGER |
//! | `Double` | REAL |
//! | `Text` | TEXT |
//! | `Bytes` | BLOB |
//! | `Json` | TEXT |
//! | `Null` | NULL |
//!
//! Integers always read back as `BigInt`. Columns declared `BOOLEAN` read
//! back as `Bool`, and columns declared `JSON` or `simple-json` as `Json`.

pub mod connection;
pub mod driver;
pub mod ffi;
pub mod types;

pub use connection::{
    AutoSaveCallback, MEMORY_PATH, OpenFlags, SqliteConfig, SqliteConnection, SqliteStatement,
};
pub use driver::{SqliteDriver, SqliteHandle};

/// Re-export the SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

/// Re-export the SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        let version = sqlite_version();
        assert!(
            version.starts_with('3'),
            "Expected SQLite 3.x, got {}",
            version
        );
        assert!(sqlite_version_number() >= 3_000_000);
    }
}
