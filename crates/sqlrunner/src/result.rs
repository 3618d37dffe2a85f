//! Result shaping.

use serde::Serialize;
use sqlrunner_core::Row;

/// Structured outcome of one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    /// Rows modified by the statement, as reported by the engine
    pub affected: u64,
    /// Rows produced, in engine order
    pub rows: Vec<Row>,
    /// Identifier generated by an INSERT, when the engine reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_id: Option<i64>,
}

impl QueryResult {
    /// The produced rows, the same sequence raw mode would return.
    pub fn raw(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// What `execute` returns, shaped by the request's structured flag.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Structured(QueryResult),
    Raw(Vec<Row>),
}

impl QueryOutput {
    pub(crate) fn shape(result: QueryResult, structured: bool) -> Self {
        if structured {
            QueryOutput::Structured(result)
        } else {
            QueryOutput::Raw(result.rows)
        }
    }

    pub fn rows(&self) -> &[Row] {
        match self {
            QueryOutput::Structured(result) => &result.rows,
            QueryOutput::Raw(rows) => rows,
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryOutput::Structured(result) => result.rows,
            QueryOutput::Raw(rows) => rows,
        }
    }

    /// The structured result, if one was requested.
    pub fn structured(self) -> Option<QueryResult> {
        match self {
            QueryOutput::Structured(result) => Some(result),
            QueryOutput::Raw(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlrunner_core::Value;

    fn sample() -> QueryResult {
        QueryResult {
            affected: 0,
            rows: vec![Row::new(vec!["id".into()], vec![Value::BigInt(7)])],
            generated_id: None,
        }
    }

    #[test]
    fn raw_mode_returns_same_rows() {
        let structured = QueryOutput::shape(sample(), true);
        let raw = QueryOutput::shape(sample(), false);
        assert_eq!(structured.rows(), raw.rows());
        assert!(raw.clone().structured().is_none());
        assert_eq!(structured.structured().unwrap().raw(), sample().raw());
    }

    #[test]
    fn serializes_rows_as_maps() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["affected"], 0);
        assert_eq!(json["rows"][0]["id"], 7);
        assert!(json.get("generated_id").is_none());
    }
}
