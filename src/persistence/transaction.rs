//! Transaction wrapper with idempotent finalize.

use crate::db::{DatabaseTransaction, SqlRow, SqlValue};
use crate::error::PersistenceError;

/// An open transaction handed out by
/// [`PersistenceManager::begin_transaction`](super::PersistenceManager::begin_transaction).
///
/// `commit` and `rollback` finalize at most once and release the underlying
/// connection exactly once; calling either a second time is a no-op.
/// Statements issued after finalize fail with `transaction_failed`.
pub struct Transaction {
    inner: Option<Box<dyn DatabaseTransaction>>,
}

impl Transaction {
    pub(crate) fn new(inner: Box<dyn DatabaseTransaction>) -> Self {
        Self { inner: Some(inner) }
    }

    fn active(&mut self) -> Result<&mut Box<dyn DatabaseTransaction>, PersistenceError> {
        self.inner
            .as_mut()
            .ok_or_else(|| PersistenceError::TransactionFailed {
                message: "transaction already finalized".to_string(),
            })
    }

    pub async fn query(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqlRow>, PersistenceError> {
        self.active()?.query(sql, params).await
    }

    pub async fn execute(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64, PersistenceError> {
        self.active()?.execute(sql, params).await
    }

    /// Commit and release the connection. No-op when already finalized.
    pub async fn commit(&mut self) -> Result<(), PersistenceError> {
        match self.inner.take() {
            Some(mut tx) => tx.commit().await,
            None => Ok(()),
        }
    }

    /// Roll back and release the connection. No-op when already finalized.
    pub async fn rollback(&mut self) -> Result<(), PersistenceError> {
        match self.inner.take() {
            Some(mut tx) => tx.rollback().await,
            None => Ok(()),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.is_none()
    }
}
