//! The database pool contract.
//!
//! The persistence layer never talks to a driver directly: it issues SQL
//! through [`DatabasePool`] / [`DatabaseTransaction`] and reads back
//! driver-neutral [`SqlRow`]s of [`SqlValue`]s. Two adapters implement the
//! contract — [`PgDatabasePool`](super::PgDatabasePool) over `sqlx` (feature
//! `postgres`) and [`SqliteDatabasePool`](super::SqliteDatabasePool) over
//! `rusqlite` for tests and embedded deployments.
//!
//! SQL built upstream is dialect-aware: placeholders, JSON extraction, and
//! containment differ between engines, so statement builders branch on
//! [`SqlDialect`] rather than on the adapter type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::PersistenceError;

/// The SQL dialect spoken by a pool adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    Sqlite,
}

impl SqlDialect {
    /// Positional parameter placeholder for 1-based index `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${n}"),
            SqlDialect::Sqlite => format!("?{n}"),
        }
    }

    /// Expression extracting a top-level payload key as text.
    pub fn json_extract_text(&self, column: &str, key: &str) -> String {
        match self {
            SqlDialect::Postgres => format!("{column}->>'{key}'"),
            SqlDialect::Sqlite => format!("json_extract({column}, '$.{key}')"),
        }
    }
}

/// A driver-neutral SQL parameter or result value.
///
/// `Null` binds as an untyped text NULL; statements that need a typed null
/// (e.g. a nullable timestamp) express it in SQL (`CASE WHEN … ELSE NULL
/// END`) instead of binding one.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    /// Normalize driver-specific boolean encodings: native booleans, 0/1
    /// integers, and `t`/`f`/`true`/`false`/`0`/`1` text.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Int(i) => Some(*i != 0),
            SqlValue::Text(s) => match s.as_str() {
                "t" | "true" | "TRUE" | "1" => Some(true),
                "f" | "false" | "FALSE" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Structured JSON view; text values are parsed on demand (the SQLite
    /// adapter stores JSON columns as text).
    pub fn as_json(&self) -> Option<Value> {
        match self {
            SqlValue::Json(v) => Some(v.clone()),
            SqlValue::Text(s) => serde_json::from_str(s).ok(),
            _ => None,
        }
    }

    /// Timestamp view; text values are parsed as RFC 3339.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            SqlValue::Timestamp(t) => Some(*t),
            SqlValue::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// One result row: ordered column names and values.
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    fn required(&self, column: &str) -> Result<&SqlValue, PersistenceError> {
        self.get(column).ok_or_else(|| PersistenceError::Driver {
            message: format!("missing column {column:?} in result row"),
        })
    }

    fn decode_failure(column: &str, expected: &str) -> PersistenceError {
        PersistenceError::Driver {
            message: format!("column {column:?} could not be decoded as {expected}"),
        }
    }

    pub fn text(&self, column: &str) -> Result<String, PersistenceError> {
        self.required(column)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Self::decode_failure(column, "text"))
    }

    pub fn opt_text(&self, column: &str) -> Result<Option<String>, PersistenceError> {
        let value = self.required(column)?;
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| Self::decode_failure(column, "text"))
    }

    pub fn int(&self, column: &str) -> Result<i64, PersistenceError> {
        self.required(column)?
            .as_i64()
            .ok_or_else(|| Self::decode_failure(column, "integer"))
    }

    pub fn json(&self, column: &str) -> Result<Value, PersistenceError> {
        let value = self.required(column)?;
        if value.is_null() {
            return Ok(Value::Null);
        }
        value
            .as_json()
            .ok_or_else(|| Self::decode_failure(column, "json"))
    }

    pub fn timestamp(&self, column: &str) -> Result<DateTime<Utc>, PersistenceError> {
        self.required(column)?
            .as_timestamp()
            .ok_or_else(|| Self::decode_failure(column, "timestamp"))
    }

    pub fn opt_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let value = self.required(column)?;
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_timestamp()
            .map(Some)
            .ok_or_else(|| Self::decode_failure(column, "timestamp"))
    }
}

/// An open database transaction.
///
/// `commit`/`rollback` consume the underlying driver transaction on first
/// call; the higher-level [`Transaction`](crate::persistence::Transaction)
/// wrapper makes the second finalize a no-op.
#[async_trait]
pub trait DatabaseTransaction: Send {
    fn dialect(&self) -> SqlDialect;

    async fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqlRow>, PersistenceError>;

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, PersistenceError>;

    /// Execute a multi-statement SQL script (used by the migrator).
    async fn execute_batch(&mut self, sql: &str) -> Result<(), PersistenceError>;

    async fn commit(&mut self) -> Result<(), PersistenceError>;

    async fn rollback(&mut self) -> Result<(), PersistenceError>;
}

/// The pluggable connection-pool contract.
#[async_trait]
pub trait DatabasePool: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, PersistenceError>;

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, PersistenceError>;

    async fn begin(&self) -> Result<Box<dyn DatabaseTransaction>, PersistenceError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(SqlDialect::Postgres.placeholder(3), "$3");
        assert_eq!(SqlDialect::Sqlite.placeholder(1), "?1");
    }

    #[test]
    fn test_bool_normalization() {
        assert_eq!(SqlValue::Bool(true).as_bool(), Some(true));
        assert_eq!(SqlValue::Int(1).as_bool(), Some(true));
        assert_eq!(SqlValue::Int(0).as_bool(), Some(false));
        assert_eq!(SqlValue::Text("t".into()).as_bool(), Some(true));
        assert_eq!(SqlValue::Text("false".into()).as_bool(), Some(false));
        assert_eq!(SqlValue::Text("maybe".into()).as_bool(), None);
        assert_eq!(SqlValue::Null.as_bool(), None);
    }

    #[test]
    fn test_json_from_text() {
        let v = SqlValue::Text(r#"{"a":1}"#.into());
        assert_eq!(v.as_json().unwrap()["a"], 1);
    }

    #[test]
    fn test_timestamp_from_text() {
        let v = SqlValue::Text("2026-03-01T12:00:00Z".into());
        let ts = v.as_timestamp().unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-03-01T12:00:00+00:00");
        assert!(SqlValue::Text("not a date".into()).as_timestamp().is_none());
    }

    #[test]
    fn test_row_access() {
        let row = SqlRow::new(
            vec!["id".into(), "version".into()],
            vec![SqlValue::Text("e-1".into()), SqlValue::Int(4)],
        );
        assert_eq!(row.text("id").unwrap(), "e-1");
        assert_eq!(row.int("version").unwrap(), 4);
        assert!(row.text("missing").is_err());
    }
}
