//! PostgreSQL pool adapter.
//!
//! Requires the `postgres` feature flag:
//! ```toml
//! [dependencies]
//! cowork = { features = ["postgres"] }
//! ```

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Postgres, Row, TypeInfo};

use crate::db::pool::{DatabasePool, DatabaseTransaction, SqlDialect, SqlRow, SqlValue};
use crate::error::PersistenceError;

/// Pool adapter over `sqlx::PgPool`.
#[derive(Clone)]
pub struct PgDatabasePool {
    pool: PgPool,
}

impl PgDatabasePool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with the given pool size.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

fn bind_params<'q>(mut query: PgQuery<'q>, params: &'q [SqlValue]) -> PgQuery<'q> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Json(v) => query.bind(v.clone()),
            SqlValue::Timestamp(t) => query.bind(*t),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<SqlRow, PersistenceError> {
    let mut columns = Vec::with_capacity(row.columns().len());
    let mut values = Vec::with_capacity(row.columns().len());

    for col in row.columns() {
        let i = col.ordinal();
        let value = match col.type_info().name() {
            "BOOL" => row
                .try_get::<Option<bool>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Bool),
            "INT2" | "INT4" | "INT8" => match col.type_info().name() {
                "INT2" => row
                    .try_get::<Option<i16>, _>(i)?
                    .map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
                "INT4" => row
                    .try_get::<Option<i32>, _>(i)?
                    .map_or(SqlValue::Null, |v| SqlValue::Int(i64::from(v))),
                _ => row
                    .try_get::<Option<i64>, _>(i)?
                    .map_or(SqlValue::Null, SqlValue::Int),
            },
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(i)?
                .map_or(SqlValue::Null, |v| SqlValue::Float(f64::from(v))),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Float),
            "JSON" | "JSONB" => row
                .try_get::<Option<serde_json::Value>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Json),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Timestamp),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(i)?
                .map_or(SqlValue::Null, |v| SqlValue::Timestamp(v.and_utc())),
            // TEXT, VARCHAR, CHAR, NAME, and anything else we read as text.
            _ => row
                .try_get::<Option<String>, _>(i)?
                .map_or(SqlValue::Null, SqlValue::Text),
        };
        columns.push(col.name().to_string());
        values.push(value);
    }
    Ok(SqlRow::new(columns, values))
}

#[async_trait]
impl DatabasePool for PgDatabasePool {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, PersistenceError> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, PersistenceError> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn begin(&self) -> Result<Box<dyn DatabaseTransaction>, PersistenceError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PersistenceError::TransactionFailed {
                message: e.to_string(),
            })?;
        Ok(Box::new(PgTransaction { tx: Some(tx) }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct PgTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgTransaction {
    fn inner(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, PersistenceError> {
        self.tx
            .as_mut()
            .ok_or_else(|| PersistenceError::TransactionFailed {
                message: "transaction already finalized".to_string(),
            })
    }
}

#[async_trait]
impl DatabaseTransaction for PgTransaction {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqlRow>, PersistenceError> {
        let tx = self.inner()?;
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&mut **tx)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, PersistenceError> {
        let tx = self.inner()?;
        let result = bind_params(sqlx::query(sql), params)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), PersistenceError> {
        let tx = self.inner()?;
        sqlx::raw_sql(sql).execute(&mut **tx).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), PersistenceError> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> Result<(), PersistenceError> {
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Ok(()),
        }
    }
}
