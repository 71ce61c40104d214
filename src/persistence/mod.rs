//! Persistence manager: pool ownership, repositories, transactions,
//! migrations, health.

pub mod migrator;
pub mod repository;
pub mod transaction;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::db::DatabasePool;
use crate::error::PersistenceError;

pub use migrator::MigrationReport;
use migrator::MigrationFailure;
pub use repository::{
    EntityFilter, EntityRecord, EntityRepository, OrderBy, OrderDirection, OrderField,
};
pub use transaction::Transaction;

/// Entity types served by [`PersistenceManager::repository`] and their
/// backing tables.
const ENTITY_TABLES: &[(&str, &str)] = &[
    ("workspace", "cowork_workspace"),
    ("artifact", "cowork_artifact"),
    ("feedback", "cowork_feedback"),
    ("evidence", "cowork_evidence"),
];

/// Result of [`PersistenceManager::health_check`]. Failures are reported
/// here, never propagated.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

type SharedMigration = Shared<BoxFuture<'static, Result<MigrationReport, MigrationFailure>>>;

/// Owner of the database pool. Exposes generic repositories, transactions,
/// checksum-verified migrations, and a non-throwing health check. Higher
/// components never bypass it to reach the driver.
pub struct PersistenceManager {
    pool: Arc<dyn DatabasePool>,
    migrations_dir: PathBuf,
    repositories: DashMap<String, Arc<EntityRepository>>,
    inflight_migration: Mutex<Option<SharedMigration>>,
}

impl PersistenceManager {
    pub fn new(pool: Arc<dyn DatabasePool>, migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            migrations_dir: migrations_dir.into(),
            repositories: DashMap::new(),
            inflight_migration: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> Arc<dyn DatabasePool> {
        Arc::clone(&self.pool)
    }

    /// Cached generic repository for a known entity type. Unknown types fail
    /// with `unknown_entity_type` before any SQL is issued.
    pub fn repository(&self, entity_type: &str) -> Result<Arc<EntityRepository>, PersistenceError> {
        if let Some(existing) = self.repositories.get(entity_type) {
            return Ok(Arc::clone(&existing));
        }

        let table = ENTITY_TABLES
            .iter()
            .find(|(name, _)| *name == entity_type)
            .map(|(_, table)| *table)
            .ok_or_else(|| PersistenceError::UnknownEntityType {
                entity_type: entity_type.to_string(),
            })?;

        let repository = Arc::new(EntityRepository::new(
            Arc::clone(&self.pool),
            entity_type,
            table,
        )?);
        self.repositories
            .insert(entity_type.to_string(), Arc::clone(&repository));
        Ok(repository)
    }

    /// Begin a transaction with idempotent finalize semantics.
    pub async fn begin_transaction(&self) -> Result<Transaction, PersistenceError> {
        Ok(Transaction::new(self.pool.begin().await?))
    }

    /// Execute a trivial query and report the result. Never returns an
    /// error: failures downgrade to `healthy: false`.
    pub async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        match self.pool.query("SELECT 1 AS ok", &[]).await {
            Ok(_) => HealthStatus {
                healthy: true,
                latency_ms: started.elapsed().as_millis() as u64,
                error: None,
            },
            Err(e) => HealthStatus {
                healthy: false,
                latency_ms: started.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        }
    }

    /// Apply pending migrations. Concurrent in-process callers share one
    /// in-flight run; the memo is cleared on completion, so a later call
    /// re-scans and skips already-applied files by checksum.
    pub async fn migrate(&self) -> Result<MigrationReport, PersistenceError> {
        let shared = {
            let mut slot = self.inflight_migration.lock();
            match slot.as_ref() {
                Some(running) => running.clone(),
                None => {
                    let fut = migrator::run(Arc::clone(&self.pool), self.migrations_dir.clone())
                        .boxed()
                        .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let result = shared.await;
        self.inflight_migration.lock().take();
        result.map_err(PersistenceError::from)
    }

    /// Release the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabasePool;
    use std::io::Write;

    fn write_migration(dir: &std::path::Path, name: &str, sql: &str) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        file.write_all(sql.as_bytes()).unwrap();
    }

    fn manager(dir: &std::path::Path) -> PersistenceManager {
        let pool = Arc::new(SqliteDatabasePool::in_memory().unwrap());
        PersistenceManager::new(pool, dir)
    }

    #[tokio::test]
    async fn test_unknown_entity_type_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let err = manager.repository("widget").unwrap_err();
        assert_eq!(err.code(), "unknown_entity_type");
    }

    #[tokio::test]
    async fn test_repository_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let a = manager.repository("workspace").unwrap();
        let b = manager.repository("workspace").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_health_check_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(SqliteDatabasePool::in_memory().unwrap());
        let manager = PersistenceManager::new(pool, dir.path());

        let healthy = manager.health_check().await;
        assert!(healthy.healthy);
        assert!(healthy.error.is_none());
    }

    #[tokio::test]
    async fn test_migrate_applies_each_file_once() {
        let dir = tempfile::tempdir().unwrap();
        write_migration(
            dir.path(),
            "0001_items.sql",
            "CREATE TABLE items (id TEXT PRIMARY KEY);",
        );
        write_migration(
            dir.path(),
            "0002_more.sql",
            "CREATE TABLE more (id TEXT PRIMARY KEY);",
        );
        let manager = manager(dir.path());

        let first = manager.migrate().await.unwrap();
        assert_eq!(first.applied, vec!["0001_items.sql", "0002_more.sql"]);
        assert!(first.skipped.is_empty());

        // Second run performs zero inserts: everything is skipped.
        let second = manager.migrate().await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.skipped.len(), 2);

        let rows = manager
            .pool()
            .query("SELECT name FROM cowork_migrations", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_migrate_detects_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        write_migration(
            dir.path(),
            "0001_items.sql",
            "CREATE TABLE items (id TEXT PRIMARY KEY);",
        );
        let manager = manager(dir.path());
        manager.migrate().await.unwrap();

        // Mutate the already-applied migration's SQL.
        write_migration(
            dir.path(),
            "0001_items.sql",
            "CREATE TABLE items (id TEXT PRIMARY KEY, extra TEXT);",
        );
        let err = manager.migrate().await.unwrap_err();
        assert_eq!(err.code(), "migration_integrity");
    }

    #[tokio::test]
    async fn test_failed_migration_rolls_back_and_halts() {
        let dir = tempfile::tempdir().unwrap();
        write_migration(
            dir.path(),
            "0001_ok.sql",
            "CREATE TABLE ok_table (id TEXT PRIMARY KEY);",
        );
        write_migration(dir.path(), "0002_broken.sql", "CREATE BOGUS SYNTAX;");
        write_migration(
            dir.path(),
            "0003_never.sql",
            "CREATE TABLE never_table (id TEXT PRIMARY KEY);",
        );
        let manager = manager(dir.path());

        let err = manager.migrate().await.unwrap_err();
        assert_eq!(err.code(), "migration_failed");

        // The good migration stays recorded, the failing one is not, and
        // later files were never attempted.
        let rows = manager
            .pool()
            .query("SELECT name FROM cowork_migrations ORDER BY name", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("name").unwrap(), "0001_ok.sql");
    }

    #[tokio::test]
    async fn test_begin_transaction_scopes_writes() {
        let pool = Arc::new(SqliteDatabasePool::in_memory().unwrap());
        let manager = PersistenceManager::new(
            pool,
            concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"),
        );
        manager.migrate().await.unwrap();

        let mut tx = manager.begin_transaction().await.unwrap();
        tx.execute(
            "INSERT INTO cowork_workspace (id, payload, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4)",
            &[
                crate::db::SqlValue::Text("ws-tx".into()),
                crate::db::SqlValue::Json(serde_json::json!({})),
                crate::db::SqlValue::Timestamp(chrono::Utc::now()),
                crate::db::SqlValue::Timestamp(chrono::Utc::now()),
            ],
        )
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        let workspace = manager.repository("workspace").unwrap();
        assert!(!workspace.exists("ws-tx").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_migrate_calls_share_one_run() {
        let dir = tempfile::tempdir().unwrap();
        write_migration(
            dir.path(),
            "0001_items.sql",
            "CREATE TABLE items (id TEXT PRIMARY KEY);",
        );
        let manager = Arc::new(manager(dir.path()));

        let (a, b) = tokio::join!(manager.migrate(), manager.migrate());
        let applied = a.unwrap().applied.len() + b.unwrap().applied.len();
        // Both callers observe the same single run.
        assert_eq!(applied, 2);

        let rows = manager
            .pool()
            .query("SELECT name FROM cowork_migrations", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
