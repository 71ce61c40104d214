//! SQLite pool adapter.
//!
//! A single `rusqlite::Connection` behind a mutex, in the same shape the
//! flow-persistence layer uses for its embedded store. One connection
//! serializes every statement, which also means statements issued while a
//! transaction is open join that transaction — acceptable for tests and
//! single-writer embedded deployments, which is what this adapter is for.
//!
//! JSON parameters are stored as serialized text and timestamps as RFC 3339
//! text; [`SqlRow`] accessors on the read side normalize both back.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::Connection;

use crate::db::pool::{DatabasePool, DatabaseTransaction, SqlDialect, SqlRow, SqlValue};
use crate::error::PersistenceError;

/// Pool adapter over a single mutex-guarded SQLite connection.
pub struct SqliteDatabasePool {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabasePool {
    /// Open (or create) a database file.
    pub fn open(path: &str) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database (the test harness default).
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn to_sqlite_value(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        SqlValue::Int(i) => SqliteValue::Integer(*i),
        SqlValue::Float(f) => SqliteValue::Real(*f),
        SqlValue::Text(s) => SqliteValue::Text(s.clone()),
        SqlValue::Json(v) => SqliteValue::Text(v.to_string()),
        SqlValue::Timestamp(t) => SqliteValue::Text(t.to_rfc3339()),
    }
}

fn from_sqlite_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Int(i),
        ValueRef::Real(f) => SqlValue::Float(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Text(String::from_utf8_lossy(b).into_owned()),
    }
}

fn run_query(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<SqlRow>, PersistenceError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let bound: Vec<SqliteValue> = params.iter().map(to_sqlite_value).collect();

    let mut rows = stmt.query(rusqlite::params_from_iter(bound))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(from_sqlite_value(row.get_ref(i)?));
        }
        out.push(SqlRow::new(columns.clone(), values));
    }
    Ok(out)
}

fn run_execute(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, PersistenceError> {
    let mut stmt = conn.prepare(sql)?;
    let bound: Vec<SqliteValue> = params.iter().map(to_sqlite_value).collect();
    let changed = stmt.execute(rusqlite::params_from_iter(bound))?;
    Ok(changed as u64)
}

#[async_trait]
impl DatabasePool for SqliteDatabasePool {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, PersistenceError> {
        run_query(&self.conn.lock(), sql, params)
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, PersistenceError> {
        run_execute(&self.conn.lock(), sql, params)
    }

    async fn begin(&self) -> Result<Box<dyn DatabaseTransaction>, PersistenceError> {
        self.conn
            .lock()
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| PersistenceError::TransactionFailed {
                message: e.to_string(),
            })?;
        Ok(Box::new(SqliteTransaction {
            conn: Arc::clone(&self.conn),
            open: true,
        }))
    }

    async fn close(&self) {
        // The connection is dropped with the last Arc reference.
    }
}

struct SqliteTransaction {
    conn: Arc<Mutex<Connection>>,
    open: bool,
}

impl SqliteTransaction {
    fn finalize(&mut self, statement: &str) -> Result<(), PersistenceError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.conn
            .lock()
            .execute_batch(statement)
            .map_err(|e| PersistenceError::TransactionFailed {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl DatabaseTransaction for SqliteTransaction {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqlRow>, PersistenceError> {
        run_query(&self.conn.lock(), sql, params)
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, PersistenceError> {
        run_execute(&self.conn.lock(), sql, params)
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), PersistenceError> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), PersistenceError> {
        self.finalize("COMMIT")
    }

    async fn rollback(&mut self) -> Result<(), PersistenceError> {
        self.finalize("ROLLBACK")
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.open {
            log::warn!("sqlite transaction dropped without finalize; rolling back");
            let _ = self.conn.lock().execute_batch("ROLLBACK");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> SqliteDatabasePool {
        let pool = SqliteDatabasePool::in_memory().unwrap();
        pool.conn
            .lock()
            .execute_batch("CREATE TABLE items (id TEXT PRIMARY KEY, payload TEXT, n INTEGER)")
            .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_query_roundtrip() {
        let pool = pool();
        pool.execute(
            "INSERT INTO items (id, payload, n) VALUES (?1, ?2, ?3)",
            &[
                SqlValue::Text("a".into()),
                SqlValue::Json(serde_json::json!({"k": "v"})),
                SqlValue::Int(7),
            ],
        )
        .await
        .unwrap();

        let rows = pool
            .query(
                "SELECT id, payload, n FROM items WHERE id = ?1",
                &[SqlValue::Text("a".into())],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("id").unwrap(), "a");
        assert_eq!(rows[0].json("payload").unwrap()["k"], "v");
        assert_eq!(rows[0].int("n").unwrap(), 7);
    }

    #[tokio::test]
    async fn test_transaction_rollback_discards() {
        let pool = pool();
        let mut tx = pool.begin().await.unwrap();
        tx.execute(
            "INSERT INTO items (id, payload, n) VALUES (?1, NULL, 0)",
            &[SqlValue::Text("tx".into())],
        )
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        let rows = pool.query("SELECT id FROM items", &[]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_transaction_commit_persists() {
        let pool = pool();
        let mut tx = pool.begin().await.unwrap();
        tx.execute(
            "INSERT INTO items (id, payload, n) VALUES (?1, NULL, 0)",
            &[SqlValue::Text("tx".into())],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let rows = pool.query("SELECT id FROM items", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
