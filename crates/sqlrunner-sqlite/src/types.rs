//! Value encoding and decoding between sqlrunner and SQLite.
//!
//! SQLite has five storage classes (INTEGER, REAL, TEXT, BLOB, NULL).
//! Binding maps every [`Value`] onto one of them; reading maps each storage
//! class back, and [`coerce`] then applies declared-type hints (JSON text,
//! BOOLEAN integers) that the storage class alone cannot express.

use crate::ffi;
use sqlrunner_core::{ColumnMeta, Value};
use std::ffi::{CStr, c_int};

unsafe fn bind_text(stmt: *mut ffi::sqlite3_stmt, index: c_int, text: &str) -> c_int {
    let bytes = text.as_bytes();
    // SAFETY: caller guarantees stmt/index; SQLITE_TRANSIENT makes SQLite copy the bytes
    unsafe {
        ffi::sqlite3_bind_text(
            stmt,
            index,
            bytes.as_ptr().cast(),
            bytes.len() as c_int,
            ffi::SQLITE_TRANSIENT(),
        )
    }
}

/// Bind a Value to a prepared statement parameter.
///
/// # Safety
/// - `stmt` must be a valid, non-null prepared statement handle
/// - `index` must be a valid 1-based parameter index
pub unsafe fn bind_value(stmt: *mut ffi::sqlite3_stmt, index: c_int, value: &Value) -> c_int {
    // SAFETY: forwarded from the caller
    unsafe {
        match value {
            Value::Null => ffi::sqlite3_bind_null(stmt, index),
            Value::Bool(b) => ffi::sqlite3_bind_int(stmt, index, c_int::from(*b)),
            Value::Int(v) => ffi::sqlite3_bind_int(stmt, index, *v),
            Value::BigInt(v) => ffi::sqlite3_bind_int64(stmt, index, *v),
            Value::Double(v) => ffi::sqlite3_bind_double(stmt, index, *v),
            Value::Text(s) => bind_text(stmt, index, s),
            Value::Bytes(b) => ffi::sqlite3_bind_blob(
                stmt,
                index,
                b.as_ptr().cast(),
                b.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            ),
            // JSON stored as text
            Value::Json(json) => bind_text(stmt, index, &json.to_string()),
        }
    }
}

/// Read a column value from the current row.
///
/// # Safety
/// - `stmt` must be a valid statement that just returned SQLITE_ROW
/// - `index` must be a valid 0-based column index
pub unsafe fn read_column(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Value {
    // SAFETY: forwarded from the caller
    unsafe {
        match ffi::sqlite3_column_type(stmt, index) {
            ffi::SQLITE_INTEGER => Value::BigInt(ffi::sqlite3_column_int64(stmt, index)),
            ffi::SQLITE_FLOAT => Value::Double(ffi::sqlite3_column_double(stmt, index)),
            ffi::SQLITE_TEXT => {
                let ptr = ffi::sqlite3_column_text(stmt, index);
                let len = ffi::sqlite3_column_bytes(stmt, index);
                if ptr.is_null() {
                    Value::Null
                } else {
                    let slice = std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize);
                    Value::Text(String::from_utf8_lossy(slice).into_owned())
                }
            }
            ffi::SQLITE_BLOB => {
                let ptr = ffi::sqlite3_column_blob(stmt, index);
                let len = ffi::sqlite3_column_bytes(stmt, index);
                if ptr.is_null() || len == 0 {
                    Value::Bytes(Vec::new())
                } else {
                    let slice = std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize);
                    Value::Bytes(slice.to_vec())
                }
            }
            _ => Value::Null,
        }
    }
}

/// Get the column name for a result column.
///
/// # Safety
/// - `stmt` must be a valid prepared statement handle
/// - `index` must be a valid 0-based column index
pub unsafe fn column_name(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Option<String> {
    // SAFETY: forwarded from the caller
    unsafe {
        let ptr = ffi::sqlite3_column_name(stmt, index);
        if ptr.is_null() {
            None
        } else {
            CStr::from_ptr(ptr).to_str().ok().map(String::from)
        }
    }
}

/// Declared type of a result column, when it maps straight to a table column.
///
/// # Safety
/// - `stmt` must be a valid prepared statement handle
/// - `index` must be a valid 0-based column index
pub unsafe fn column_decl_type(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Option<String> {
    // SAFETY: forwarded from the caller
    unsafe {
        let ptr = ffi::sqlite3_column_decltype(stmt, index);
        if ptr.is_null() {
            None
        } else {
            CStr::from_ptr(ptr).to_str().ok().map(String::from)
        }
    }
}

/// Column metadata for every result column of a prepared statement.
///
/// # Safety
/// `stmt` must be a valid prepared statement handle.
pub unsafe fn columns(stmt: *mut ffi::sqlite3_stmt) -> Vec<ColumnMeta> {
    // SAFETY: forwarded from the caller
    let count = unsafe { ffi::sqlite3_column_count(stmt) };
    (0..count)
        .map(|i| {
            // SAFETY: i < column count
            let name = unsafe { column_name(stmt, i) }.unwrap_or_else(|| format!("col{}", i));
            let meta = ColumnMeta::new(name);
            // SAFETY: i < column count
            match unsafe { column_decl_type(stmt, i) } {
                Some(decl) => meta.with_decl_type(decl),
                None => meta,
            }
        })
        .collect()
}

/// Apply declared-type hints to a value read from SQLite.
///
/// - `JSON` / `SIMPLE-JSON` text is parsed into [`Value::Json`]; text that
///   does not parse is left as text
/// - `BOOLEAN` integers become [`Value::Bool`]
pub fn coerce(column: &ColumnMeta, value: Value) -> Value {
    match value {
        Value::Text(text) if column.is_declared("json") || column.is_declared("simple-json") => {
            match serde_json::from_str(&text) {
                Ok(json) => Value::Json(json),
                Err(_) => Value::Text(text),
            }
        }
        Value::BigInt(v) if column.is_declared("boolean") => Value::Bool(v != 0),
        Value::Int(v) if column.is_declared("boolean") => Value::Bool(v != 0),
        other => other,
    }
}
