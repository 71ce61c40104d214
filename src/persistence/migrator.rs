//! Checksum-verified SQL migrations.
//!
//! Migration files are plain `*.sql` scripts applied in file-name order.
//! Each applied file is recorded in `cowork_migrations` together with the
//! sha256 of its content; a recorded name whose file no longer hashes to the
//! recorded checksum is a hard integrity violation that halts the run.
//! Each pending file runs inside its own transaction (script + checksum
//! insert together), so a failing migration rolls back cleanly and aborts
//! the call without touching already-applied migrations.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::db::{DatabasePool, SqlValue};
use crate::error::PersistenceError;

const MIGRATIONS_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS cowork_migrations (
    name TEXT PRIMARY KEY,
    checksum TEXT NOT NULL,
    executed_at TIMESTAMPTZ NOT NULL
)";

/// Outcome of one `migrate()` run.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Migration file names applied by this run, in order.
    pub applied: Vec<String>,
    /// Already-recorded file names skipped by checksum match.
    pub skipped: Vec<String>,
}

/// Cloneable failure carried through the shared in-flight migration future.
#[derive(Debug, Clone)]
pub(crate) enum MigrationFailure {
    Integrity {
        name: String,
        recorded: String,
        actual: String,
    },
    Failed {
        name: String,
        message: String,
    },
}

impl From<MigrationFailure> for PersistenceError {
    fn from(failure: MigrationFailure) -> Self {
        match failure {
            MigrationFailure::Integrity {
                name,
                recorded,
                actual,
            } => PersistenceError::MigrationIntegrity {
                name,
                recorded,
                actual,
            },
            MigrationFailure::Failed { name, message } => {
                PersistenceError::MigrationFailed { name, message }
            }
        }
    }
}

fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn list_migration_files(dir: &PathBuf) -> Result<Vec<(String, PathBuf)>, MigrationFailure> {
    let entries = std::fs::read_dir(dir).map_err(|e| MigrationFailure::Failed {
        name: dir.display().to_string(),
        message: format!("cannot read migrations directory: {e}"),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| MigrationFailure::Failed {
            name: dir.display().to_string(),
            message: e.to_string(),
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("sql") {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                files.push((name.to_string(), path));
            }
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Run all pending migrations from `dir` against `pool`.
pub(crate) async fn run(
    pool: Arc<dyn DatabasePool>,
    dir: PathBuf,
) -> Result<MigrationReport, MigrationFailure> {
    pool.execute(MIGRATIONS_TABLE_DDL, &[])
        .await
        .map_err(|e| MigrationFailure::Failed {
            name: "cowork_migrations".to_string(),
            message: e.to_string(),
        })?;

    let dialect = pool.dialect();
    let select_sql = format!(
        "SELECT checksum FROM cowork_migrations WHERE name = {}",
        dialect.placeholder(1)
    );
    let insert_sql = format!(
        "INSERT INTO cowork_migrations (name, checksum, executed_at) VALUES ({}, {}, {})",
        dialect.placeholder(1),
        dialect.placeholder(2),
        dialect.placeholder(3)
    );

    let mut report = MigrationReport::default();

    for (name, path) in list_migration_files(&dir)? {
        let content = std::fs::read_to_string(&path).map_err(|e| MigrationFailure::Failed {
            name: name.clone(),
            message: format!("cannot read migration file: {e}"),
        })?;
        let actual = checksum(&content);

        let recorded = pool
            .query(&select_sql, &[SqlValue::Text(name.clone())])
            .await
            .map_err(|e| MigrationFailure::Failed {
                name: name.clone(),
                message: e.to_string(),
            })?
            .into_iter()
            .next()
            .map(|row| row.text("checksum"))
            .transpose()
            .map_err(|e| MigrationFailure::Failed {
                name: name.clone(),
                message: e.to_string(),
            })?;

        match recorded {
            Some(recorded) if recorded == actual => {
                report.skipped.push(name);
                continue;
            }
            Some(recorded) => {
                return Err(MigrationFailure::Integrity {
                    name,
                    recorded,
                    actual,
                });
            }
            None => {}
        }

        let mut tx = pool.begin().await.map_err(|e| MigrationFailure::Failed {
            name: name.clone(),
            message: e.to_string(),
        })?;

        let applied: Result<(), PersistenceError> = async {
            tx.execute_batch(&content).await?;
            tx.execute(
                &insert_sql,
                &[
                    SqlValue::Text(name.clone()),
                    SqlValue::Text(actual.clone()),
                    SqlValue::Timestamp(Utc::now()),
                ],
            )
            .await?;
            Ok(())
        }
        .await;

        match applied {
            Ok(()) => {
                tx.commit().await.map_err(|e| MigrationFailure::Failed {
                    name: name.clone(),
                    message: e.to_string(),
                })?;
                log::info!("applied migration {name}");
                report.applied.push(name);
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    log::warn!("rollback of failed migration {name} errored: {rollback_err}");
                }
                return Err(MigrationFailure::Failed {
                    name,
                    message: e.to_string(),
                });
            }
        }
    }

    Ok(report)
}
