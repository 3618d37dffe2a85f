//! Statement requests and mutation classification.

use crate::value::Value;

/// The one verb treated as read-only.
pub const READ_VERB: &str = "SELECT";

/// Verbs whose successful execution creates rows with generated ids.
pub const INSERT_VERBS: &[&str] = &["INSERT", "REPLACE"];

/// First whitespace-delimited token of the trimmed statement text.
pub fn command_keyword(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("")
}

/// Whether a statement can leave unflushed mutations behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Starts with the read verb; never marks a session dirty
    Read,
    /// Starts with an insert verb; may report a generated id
    Insert,
    /// Anything else, including DDL and PRAGMA
    Write,
}

impl StatementKind {
    /// Classify by command keyword only. No validation happens here.
    pub fn classify(sql: &str) -> Self {
        let keyword = command_keyword(sql);
        if keyword.eq_ignore_ascii_case(READ_VERB) {
            StatementKind::Read
        } else if INSERT_VERBS
            .iter()
            .any(|verb| keyword.eq_ignore_ascii_case(verb))
        {
            StatementKind::Insert
        } else {
            StatementKind::Write
        }
    }

    pub const fn is_read(self) -> bool {
        matches!(self, StatementKind::Read)
    }

    /// Whether the engine's last generated id can belong to this statement.
    pub const fn generates_id(self) -> bool {
        matches!(self, StatementKind::Insert)
    }
}

/// An immutable statement to execute: text, ordered parameters, result shape.
///
/// Parameters are optional values; an absent parameter binds as NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementRequest {
    sql: String,
    params: Vec<Option<Value>>,
    structured: bool,
}

impl StatementRequest {
    /// A statement with no parameters returning raw rows.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            structured: false,
        }
    }

    /// A statement with present parameters.
    pub fn with_params(sql: impl Into<String>, params: impl IntoIterator<Item = Value>) -> Self {
        Self {
            sql: sql.into(),
            params: params.into_iter().map(Some).collect(),
            structured: false,
        }
    }

    /// Append one present parameter.
    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(Some(value.into()));
        self
    }

    /// Append a parameter that may be absent.
    #[must_use]
    pub fn bind_optional(mut self, value: Option<Value>) -> Self {
        self.params.push(value);
        self
    }

    /// Ask for a structured result instead of raw rows.
    #[must_use]
    pub fn structured(mut self) -> Self {
        self.structured = true;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Option<Value>] {
        &self.params
    }

    pub fn wants_structured(&self) -> bool {
        self.structured
    }

    pub fn kind(&self) -> StatementKind {
        StatementKind::classify(&self.sql)
    }

    /// Parameters as bound at the native boundary: absent becomes NULL.
    pub fn bound_params(&self) -> Vec<Value> {
        self.params
            .iter()
            .map(|p| p.clone().unwrap_or(Value::Null))
            .collect()
    }
}
