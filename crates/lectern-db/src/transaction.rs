//! Database transaction utilities
//!
//! Used by batch commits that must apply all of their operations or none.

use crate::document::{DocumentStoreError, DocumentStoreResult};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

/// A database transaction wrapper with explicit commit
///
/// Dropping the guard without calling [`commit`](Self::commit) rolls the
/// transaction back.
///
/// # Example
///
/// ```ignore
/// let mut tx = TransactionGuard::begin(&pool).await?;
/// sqlx::query("UPDATE ...").execute(tx.connection()?).await?;
/// tx.commit().await?;
/// ```
pub struct TransactionGuard {
    transaction: Option<Transaction<'static, Postgres>>,
}

impl TransactionGuard {
    /// Begin a new database transaction
    pub async fn begin(pool: &PgPool) -> DocumentStoreResult<Self> {
        let transaction = pool.begin().await?;
        Ok(Self {
            transaction: Some(transaction),
        })
    }

    /// Connection to run statements on inside the transaction.
    pub fn connection(&mut self) -> DocumentStoreResult<&mut PgConnection> {
        self.transaction
            .as_mut()
            .map(|tx| &mut **tx)
            .ok_or_else(|| {
                DocumentStoreError::Unavailable(
                    "Transaction was already committed or rolled back".to_string(),
                )
            })
    }

    /// Commit the transaction
    pub async fn commit(mut self) -> DocumentStoreResult<()> {
        if let Some(tx) = self.transaction.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    /// Rollback the transaction
    pub async fn rollback(mut self) -> DocumentStoreResult<()> {
        if let Some(tx) = self.transaction.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            // sqlx queues the rollback when the inner transaction drops.
            tracing::debug!("Transaction dropped without commit - rolling back");
        }
    }
}
