//! Generic JSON entity repository.
//!
//! Every entity table shares the shape `(id, payload, created_at,
//! updated_at)` with the payload opaque to the store. The repository builds
//! its SQL dialect-aware and validates every caller-controlled identifier
//! (table name, filter keys, order-by keys) against a safe-identifier
//! pattern before interpolation — the sole injection defense for
//! caller-controlled field names.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::db::{DatabasePool, SqlDialect, SqlRow, SqlValue};
use crate::error::PersistenceError;

static SAFE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// Reject identifiers that are unsafe to interpolate into SQL.
pub(crate) fn ensure_safe_identifier(identifier: &str) -> Result<(), PersistenceError> {
    if SAFE_IDENTIFIER.is_match(identifier) {
        Ok(())
    } else {
        Err(PersistenceError::InvalidIdentifier {
            identifier: identifier.to_string(),
        })
    }
}

/// Generic record shape behind every repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRecord {
    pub id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    fn sql(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

/// What to order by: a metadata column or a payload key extracted as text.
#[derive(Debug, Clone)]
pub enum OrderField {
    Column(String),
    PayloadKey(String),
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: OrderField,
    pub direction: OrderDirection,
}

/// Filter for [`EntityRepository::find_all`].
///
/// Metadata filters cover `id` (string or string array for IN) and
/// `created_at`/`updated_at` (strict RFC 3339 date-times). Payload filters
/// are containment checks on top-level payload keys; an array value is OR'd
/// across its elements.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub metadata: HashMap<String, Value>,
    pub payload: HashMap<String, Value>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl EntityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.insert("id".into(), Value::String(id.into()));
        self
    }

    pub fn with_metadata(mut self, field: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(field.into(), value);
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn order_by(mut self, field: OrderField, direction: OrderDirection) -> Self {
        self.order_by = Some(OrderBy { field, direction });
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// CRUD over one `(id, payload, created_at, updated_at)` table.
pub struct EntityRepository {
    pool: Arc<dyn DatabasePool>,
    entity_type: String,
    table: String,
}

impl std::fmt::Debug for EntityRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRepository")
            .field("entity_type", &self.entity_type)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl EntityRepository {
    pub(crate) fn new(
        pool: Arc<dyn DatabasePool>,
        entity_type: impl Into<String>,
        table: impl Into<String>,
    ) -> Result<Self, PersistenceError> {
        let table = table.into();
        ensure_safe_identifier(&table)?;
        Ok(Self {
            pool,
            entity_type: entity_type.into(),
            table,
        })
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn dialect(&self) -> SqlDialect {
        self.pool.dialect()
    }

    fn record_from_row(&self, row: &SqlRow) -> Result<EntityRecord, PersistenceError> {
        Ok(EntityRecord {
            id: row.text("id")?,
            payload: row.json("payload")?,
            created_at: row.timestamp("created_at")?,
            updated_at: row.timestamp("updated_at")?,
        })
    }

    /// Insert a new entity. Any caller-supplied `id`, `created_at`, or
    /// `updated_at` payload keys are stripped; the repository assigns a
    /// fresh id and current timestamps.
    pub async fn create(&self, payload: Value) -> Result<EntityRecord, PersistenceError> {
        let mut payload = payload;
        if let Value::Object(ref mut map) = payload {
            for reserved in ["id", "created_at", "updated_at"] {
                map.remove(reserved);
            }
        }

        let record = EntityRecord {
            id: Uuid::new_v4().to_string(),
            payload,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let d = self.dialect();
        let sql = format!(
            "INSERT INTO {} (id, payload, created_at, updated_at) VALUES ({}, {}, {}, {})",
            self.table,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3),
            d.placeholder(4)
        );
        self.pool
            .execute(
                &sql,
                &[
                    SqlValue::Text(record.id.clone()),
                    SqlValue::Json(record.payload.clone()),
                    SqlValue::Timestamp(record.created_at),
                    SqlValue::Timestamp(record.updated_at),
                ],
            )
            .await?;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<EntityRecord>, PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "SELECT id, payload, created_at, updated_at FROM {} WHERE id = {}",
            self.table,
            d.placeholder(1)
        );
        let rows = self
            .pool
            .query(&sql, &[SqlValue::Text(id.to_string())])
            .await?;
        rows.first().map(|row| self.record_from_row(row)).transpose()
    }

    /// Merge a partial payload onto the stored record (shallow object merge,
    /// not a replace) and bump `updated_at`.
    pub async fn update(
        &self,
        id: &str,
        partial: Value,
    ) -> Result<EntityRecord, PersistenceError> {
        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| PersistenceError::EntityNotFound {
                entity_type: self.entity_type.clone(),
                id: id.to_string(),
            })?;

        let merged = match (existing.payload, partial) {
            (Value::Object(mut base), Value::Object(patch)) => {
                for (key, value) in patch {
                    base.insert(key, value);
                }
                Value::Object(base)
            }
            (_, replacement) => replacement,
        };

        let updated_at = Utc::now();
        let d = self.dialect();
        let sql = format!(
            "UPDATE {} SET payload = {}, updated_at = {} WHERE id = {}",
            self.table,
            d.placeholder(1),
            d.placeholder(2),
            d.placeholder(3)
        );
        self.pool
            .execute(
                &sql,
                &[
                    SqlValue::Json(merged.clone()),
                    SqlValue::Timestamp(updated_at),
                    SqlValue::Text(id.to_string()),
                ],
            )
            .await?;

        Ok(EntityRecord {
            id: id.to_string(),
            payload: merged,
            created_at: existing.created_at,
            updated_at,
        })
    }

    /// Unconditional delete. Returns whether a row existed.
    pub async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        let d = self.dialect();
        let sql = format!("DELETE FROM {} WHERE id = {}", self.table, d.placeholder(1));
        let changed = self
            .pool
            .execute(&sql, &[SqlValue::Text(id.to_string())])
            .await?;
        Ok(changed > 0)
    }

    pub async fn exists(&self, id: &str) -> Result<bool, PersistenceError> {
        let d = self.dialect();
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = {}) AS present",
            self.table,
            d.placeholder(1)
        );
        let rows = self
            .pool
            .query(&sql, &[SqlValue::Text(id.to_string())])
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("present"))
            .and_then(SqlValue::as_bool)
            .unwrap_or(false))
    }

    pub async fn find_all(
        &self,
        filter: &EntityFilter,
    ) -> Result<Vec<EntityRecord>, PersistenceError> {
        let d = self.dialect();
        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        let mut metadata: Vec<(&String, &Value)> = filter.metadata.iter().collect();
        metadata.sort_by(|a, b| a.0.cmp(b.0));
        for (field, value) in metadata {
            self.push_metadata_condition(d, field, value, &mut conditions, &mut params)?;
        }

        let mut payload: Vec<(&String, &Value)> = filter.payload.iter().collect();
        payload.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in payload {
            self.push_payload_condition(d, key, value, &mut conditions, &mut params)?;
        }

        let mut sql = format!(
            "SELECT id, payload, created_at, updated_at FROM {}",
            self.table
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        if let Some(order) = &filter.order_by {
            let expression = match &order.field {
                OrderField::Column(column) => {
                    if !matches!(column.as_str(), "id" | "created_at" | "updated_at") {
                        return Err(PersistenceError::InvalidFilter {
                            field: column.clone(),
                            message: "unknown order column".to_string(),
                        });
                    }
                    column.clone()
                }
                OrderField::PayloadKey(key) => {
                    ensure_safe_identifier(key)?;
                    d.json_extract_text("payload", key)
                }
            };
            sql.push_str(&format!(" ORDER BY {} {}", expression, order.direction.sql()));
        }

        if let Some(limit) = filter.limit {
            if limit <= 0 {
                return Err(PersistenceError::InvalidPagination {
                    field: "limit",
                    value: limit,
                });
            }
            params.push(SqlValue::Int(limit));
            sql.push_str(&format!(" LIMIT {}", d.placeholder(params.len())));
        } else if filter.offset.is_some() && d == SqlDialect::Sqlite {
            // SQLite requires a LIMIT clause before OFFSET.
            sql.push_str(" LIMIT -1");
        }

        if let Some(offset) = filter.offset {
            if offset < 0 {
                return Err(PersistenceError::InvalidPagination {
                    field: "offset",
                    value: offset,
                });
            }
            params.push(SqlValue::Int(offset));
            sql.push_str(&format!(" OFFSET {}", d.placeholder(params.len())));
        }

        let rows = self.pool.query(&sql, &params).await?;
        rows.iter().map(|row| self.record_from_row(row)).collect()
    }

    fn push_metadata_condition(
        &self,
        d: SqlDialect,
        field: &str,
        value: &Value,
        conditions: &mut Vec<String>,
        params: &mut Vec<SqlValue>,
    ) -> Result<(), PersistenceError> {
        let candidates: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        if candidates.is_empty() {
            return Err(PersistenceError::InvalidFilter {
                field: field.to_string(),
                message: "empty IN list".to_string(),
            });
        }

        let mut bound = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            bound.push(match field {
                "id" => match candidate {
                    Value::String(s) => SqlValue::Text(s.clone()),
                    other => {
                        return Err(PersistenceError::InvalidFilter {
                            field: field.to_string(),
                            message: format!("id filter must be a string, got {other}"),
                        })
                    }
                },
                "created_at" | "updated_at" => match candidate {
                    Value::String(s) => {
                        let parsed = DateTime::parse_from_rfc3339(s).map_err(|e| {
                            PersistenceError::InvalidFilter {
                                field: field.to_string(),
                                message: format!("unparsable date-time {s:?}: {e}"),
                            }
                        })?;
                        SqlValue::Timestamp(parsed.with_timezone(&Utc))
                    }
                    other => {
                        return Err(PersistenceError::InvalidFilter {
                            field: field.to_string(),
                            message: format!("date-time filter must be a string, got {other}"),
                        })
                    }
                },
                other => {
                    return Err(PersistenceError::InvalidFilter {
                        field: other.to_string(),
                        message: "unknown metadata field".to_string(),
                    })
                }
            });
        }

        let mut placeholders = Vec::with_capacity(bound.len());
        for value in bound {
            params.push(value);
            placeholders.push(d.placeholder(params.len()));
        }
        if placeholders.len() == 1 {
            conditions.push(format!("{} = {}", field, placeholders[0]));
        } else {
            conditions.push(format!("{} IN ({})", field, placeholders.join(", ")));
        }
        Ok(())
    }

    fn push_payload_condition(
        &self,
        d: SqlDialect,
        key: &str,
        value: &Value,
        conditions: &mut Vec<String>,
        params: &mut Vec<SqlValue>,
    ) -> Result<(), PersistenceError> {
        ensure_safe_identifier(key)?;

        let candidates: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        if candidates.is_empty() {
            return Err(PersistenceError::InvalidFilter {
                field: key.to_string(),
                message: "empty containment list".to_string(),
            });
        }

        let mut alternatives = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match d {
                SqlDialect::Postgres => {
                    params.push(SqlValue::Json(serde_json::json!({ key: candidate })));
                    alternatives.push(format!("payload @> {}", d.placeholder(params.len())));
                }
                SqlDialect::Sqlite => {
                    let extract = d.json_extract_text("payload", key);
                    match candidate {
                        Value::Null => alternatives.push(format!("{extract} IS NULL")),
                        Value::Bool(b) => {
                            params.push(SqlValue::Bool(*b));
                            alternatives
                                .push(format!("{extract} = {}", d.placeholder(params.len())));
                        }
                        Value::Number(n) => {
                            params.push(if let Some(i) = n.as_i64() {
                                SqlValue::Int(i)
                            } else {
                                SqlValue::Float(n.as_f64().unwrap_or(0.0))
                            });
                            alternatives
                                .push(format!("{extract} = {}", d.placeholder(params.len())));
                        }
                        Value::String(s) => {
                            params.push(SqlValue::Text(s.clone()));
                            alternatives
                                .push(format!("{extract} = {}", d.placeholder(params.len())));
                        }
                        nested => {
                            params.push(SqlValue::Text(nested.to_string()));
                            alternatives
                                .push(format!("{extract} = {}", d.placeholder(params.len())));
                        }
                    }
                }
            }
        }

        if alternatives.len() == 1 {
            conditions.push(alternatives.remove(0));
        } else {
            conditions.push(format!("({})", alternatives.join(" OR ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabasePool;
    use serde_json::json;

    async fn repository() -> EntityRepository {
        let pool = SqliteDatabasePool::in_memory().unwrap();
        pool.execute(
            "CREATE TABLE cowork_workspace (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            &[],
        )
        .await
        .unwrap();
        EntityRepository::new(Arc::new(pool), "workspace", "cowork_workspace").unwrap()
    }

    #[test]
    fn test_safe_identifier() {
        assert!(ensure_safe_identifier("cowork_workspace").is_ok());
        assert!(ensure_safe_identifier("_payload2").is_ok());
        let err = ensure_safe_identifier("drop table; --").unwrap_err();
        assert_eq!(err.code(), "invalid_identifier");
        assert!(ensure_safe_identifier("a-b").is_err());
        assert!(ensure_safe_identifier("").is_err());
    }

    #[tokio::test]
    async fn test_create_strips_reserved_keys() {
        let repo = repository().await;
        let record = repo
            .create(json!({"id": "attacker", "created_at": "1999-01-01", "name": "alpha"}))
            .await
            .unwrap();
        assert_ne!(record.id, "attacker");
        assert!(record.payload.get("id").is_none());
        assert!(record.payload.get("created_at").is_none());
        assert_eq!(record.payload["name"], "alpha");

        let fetched = repo.get(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.payload, record.payload);
    }

    #[tokio::test]
    async fn test_update_merges_partial_payload() {
        let repo = repository().await;
        let record = repo
            .create(json!({"name": "alpha", "status": "draft"}))
            .await
            .unwrap();

        let updated = repo
            .update(&record.id, json!({"status": "ready"}))
            .await
            .unwrap();
        assert_eq!(updated.payload["name"], "alpha");
        assert_eq!(updated.payload["status"], "ready");
        assert!(updated.updated_at >= record.updated_at);
    }

    #[tokio::test]
    async fn test_update_missing_entity() {
        let repo = repository().await;
        let err = repo.update("nope", json!({})).await.unwrap_err();
        assert_eq!(err.code(), "entity_not_found");
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let repo = repository().await;
        let record = repo.create(json!({"name": "alpha"})).await.unwrap();
        assert!(repo.exists(&record.id).await.unwrap());
        assert!(repo.delete(&record.id).await.unwrap());
        assert!(!repo.exists(&record.id).await.unwrap());
        assert!(!repo.delete(&record.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_all_payload_containment() {
        let repo = repository().await;
        repo.create(json!({"kind": "report", "owner": "research"}))
            .await
            .unwrap();
        repo.create(json!({"kind": "report", "owner": "qa"}))
            .await
            .unwrap();
        repo.create(json!({"kind": "note", "owner": "qa"}))
            .await
            .unwrap();

        let filter = EntityFilter::new().with_payload("kind", json!("report"));
        assert_eq!(repo.find_all(&filter).await.unwrap().len(), 2);

        // Array values OR across alternatives.
        let filter = EntityFilter::new().with_payload("owner", json!(["research", "qa"]));
        assert_eq!(repo.find_all(&filter).await.unwrap().len(), 3);

        let filter = EntityFilter::new()
            .with_payload("kind", json!("report"))
            .with_payload("owner", json!("qa"));
        assert_eq!(repo.find_all(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_all_order_and_pagination() {
        let repo = repository().await;
        for name in ["charlie", "alpha", "bravo"] {
            repo.create(json!({"name": name})).await.unwrap();
        }

        let filter = EntityFilter::new()
            .order_by(
                OrderField::PayloadKey("name".into()),
                OrderDirection::Asc,
            )
            .limit(2)
            .offset(1);
        let records = repo.find_all(&filter).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload["name"], "bravo");
        assert_eq!(records[1].payload["name"], "charlie");
    }

    #[tokio::test]
    async fn test_find_all_rejects_bad_pagination() {
        let repo = repository().await;
        let err = repo
            .find_all(&EntityFilter::new().limit(0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_pagination");

        let err = repo
            .find_all(&EntityFilter::new().offset(-1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_pagination");
    }

    #[tokio::test]
    async fn test_find_all_rejects_bad_filters() {
        let repo = repository().await;

        let filter = EntityFilter::new().with_metadata("created_at", json!("yesterday"));
        let err = repo.find_all(&filter).await.unwrap_err();
        assert_eq!(err.code(), "invalid_filter");

        let filter = EntityFilter::new().with_metadata("owner", json!("x"));
        let err = repo.find_all(&filter).await.unwrap_err();
        assert_eq!(err.code(), "invalid_filter");

        let filter = EntityFilter::new().with_payload("bad-key", json!("x"));
        let err = repo.find_all(&filter).await.unwrap_err();
        assert_eq!(err.code(), "invalid_identifier");
    }

    #[tokio::test]
    async fn test_find_all_by_id_and_timestamps() {
        let repo = repository().await;
        let a = repo.create(json!({"name": "a"})).await.unwrap();
        let b = repo.create(json!({"name": "b"})).await.unwrap();

        let filter = EntityFilter::new().with_id(a.id.clone());
        let records = repo.find_all(&filter).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, a.id);

        let filter = EntityFilter::new()
            .with_metadata("id", json!([a.id.clone(), b.id.clone()]));
        assert_eq!(repo.find_all(&filter).await.unwrap().len(), 2);

        let filter = EntityFilter::new()
            .with_metadata("created_at", json!(a.created_at.to_rfc3339()));
        let records = repo.find_all(&filter).await.unwrap();
        assert!(records.iter().any(|r| r.id == a.id));
    }
}
