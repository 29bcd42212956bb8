//! Unit of Work: transaction boundary over a persistence context
//!
//! A unit of work shares its context with the repositories of the same request
//! scope. Repository operations flush immediately; wrapping them between
//! [`UnitOfWork::begin_transaction`] and [`UnitOfWork::commit_transaction`]
//! makes those flushes atomic.
//!
//! ```text
//! Idle --begin--> InTransaction --commit|rollback--> Idle
//!                 InTransaction --begin--> InTransaction
//! Idle --commit|rollback--> Idle
//! ```
//!
//! Dropping a unit of work with an open transaction rolls the transaction back.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::context::{ContextTransaction, PersistenceContext};
use crate::error::{Result, StoreError};

/// Transaction boundary for a request scope
pub trait UnitOfWork: Send + Sync {
    /// Open a transaction unless one is already open
    fn begin_transaction(&self) -> impl Future<Output = Result<()>> + Send;

    /// Flush pending changes and commit the open transaction, if any
    ///
    /// On failure the transaction is rolled back and the original error is
    /// returned. Either way no transaction remains open afterwards.
    fn commit_transaction(&self) -> impl Future<Output = Result<()>> + Send;

    /// Roll back the open transaction; no-op when idle
    fn rollback_transaction(&self) -> impl Future<Output = Result<()>> + Send;

    /// Flush pending changes, returning the number of affected rows
    fn save_changes(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Whether a transaction is currently open
    fn has_active_transaction(&self) -> impl Future<Output = bool> + Send;
}

/// [`UnitOfWork`] over a shared persistence context
pub struct ContextUnitOfWork<C: PersistenceContext> {
    context: Arc<C>,
    transaction: Mutex<Option<C::Transaction>>,
}

impl<C: PersistenceContext> ContextUnitOfWork<C> {
    /// Create a unit of work over `context`
    pub fn new(context: Arc<C>) -> Self {
        Self {
            context,
            transaction: Mutex::new(None),
        }
    }

    /// The underlying context
    pub fn context(&self) -> &Arc<C> {
        &self.context
    }
}

impl<C: PersistenceContext> UnitOfWork for ContextUnitOfWork<C> {
    async fn begin_transaction(&self) -> Result<()> {
        let mut slot = self.transaction.lock().await;
        if slot.is_none() {
            *slot = Some(self.context.begin_transaction().await?);
            tracing::debug!("Transaction started");
        }
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let mut slot = self.transaction.lock().await;

        let result = async {
            self.context.save_changes(None).await?;
            if let Some(transaction) = slot.as_mut() {
                transaction.commit().await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;

        if result.is_err() {
            if let Some(transaction) = slot.as_mut() {
                if let Err(e) = transaction.rollback().await {
                    tracing::error!(error = %e, "Rollback after failed commit failed");
                }
            }
        }
        slot.take();

        Ok(result?)
    }

    async fn rollback_transaction(&self) -> Result<()> {
        let Some(mut transaction) = self.transaction.lock().await.take() else {
            return Ok(());
        };
        transaction.rollback().await?;
        tracing::debug!("Transaction rolled back");
        Ok(())
    }

    async fn save_changes(&self, cancel: Option<&CancellationToken>) -> Result<usize> {
        Ok(self.context.save_changes(cancel).await?)
    }

    async fn has_active_transaction(&self) -> bool {
        self.transaction.lock().await.is_some()
    }
}

impl<C: PersistenceContext> Drop for ContextUnitOfWork<C> {
    fn drop(&mut self) {
        // The handle's own Drop performs the rollback
        if self.transaction.get_mut().take().is_some() {
            tracing::debug!("Unit of work released with an open transaction");
        }
    }
}
