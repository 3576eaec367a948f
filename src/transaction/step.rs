// ============================================================================
// Transaction Steps
// ============================================================================
//
// A step pairs an action with its compensation. The coordinator never looks
// inside a step: `rollback` must undo exactly what `execute` did.
//
// ============================================================================

use crate::core::{DbError, Result, Snapshot};
use crate::storage::{FileBackup, Store};
use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{Level, event};

#[async_trait]
pub trait Step<T>: Send {
    /// Short label used in logs.
    fn name(&self) -> &str {
        "step"
    }

    async fn execute(&mut self) -> Result<T>;

    /// Undoes a successful `execute`. Only called on steps that succeeded.
    async fn rollback(&mut self) -> Result<()>;

    /// Called once every step has succeeded, to drop rollback state.
    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

type ExecuteFn<T> = Box<dyn FnMut() -> BoxFuture<'static, Result<T>> + Send>;
type RollbackFn = Box<dyn FnMut() -> BoxFuture<'static, Result<()>> + Send>;

/// A step assembled from two closures.
///
/// ```ignore
/// let step = FnStep::new(
///     "charge",
///     move || Box::pin(async move { ledger.charge(42).await }),
///     move || Box::pin(async move { ledger.refund(42).await }),
/// );
/// ```
pub struct FnStep<T> {
    name: String,
    execute: ExecuteFn<T>,
    rollback: RollbackFn,
}

impl<T> FnStep<T> {
    pub fn new<E, R>(name: impl Into<String>, execute: E, rollback: R) -> Self
    where
        E: FnMut() -> BoxFuture<'static, Result<T>> + Send + 'static,
        R: FnMut() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Box::new(execute),
            rollback: Box::new(rollback),
        }
    }

    /// A step with nothing to compensate (reads, notifications).
    pub fn without_rollback<E>(name: impl Into<String>, execute: E) -> Self
    where
        E: FnMut() -> BoxFuture<'static, Result<T>> + Send + 'static,
    {
        Self::new(name, execute, || Box::pin(async { Ok(()) }))
    }

    pub fn boxed(self) -> Box<dyn Step<T>>
    where
        T: Send + 'static,
    {
        Box::new(self)
    }
}

#[async_trait]
impl<T: Send> Step<T> for FnStep<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&mut self) -> Result<T> {
        (self.execute)().await
    }

    async fn rollback(&mut self) -> Result<()> {
        (self.rollback)().await
    }
}

type TransformFn = Box<dyn FnOnce(&mut Snapshot) -> Result<()> + Send>;

/// Rewrites one store collection with backup-based compensation.
///
/// `execute` flushes the collection, copies its document to `<file>.bak`,
/// applies the transform and waits for the new snapshot to reach disk.
/// `rollback` writes the backed-up snapshot back through the store, so the
/// cache and the file agree, and deletes the backup. `commit` deletes it.
pub struct CollectionStep {
    store: Store,
    collection: String,
    transform: Option<TransformFn>,
    backup: Option<FileBackup>,
}

impl CollectionStep {
    pub fn new<F>(store: &Store, collection: &str, transform: F) -> Self
    where
        F: FnOnce(&mut Snapshot) -> Result<()> + Send + 'static,
    {
        Self {
            store: store.clone(),
            collection: collection.to_string(),
            transform: Some(Box::new(transform)),
            backup: None,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

#[async_trait]
impl Step<Snapshot> for CollectionStep {
    fn name(&self) -> &str {
        &self.collection
    }

    async fn execute(&mut self) -> Result<Snapshot> {
        let transform = self.transform.take().ok_or_else(|| {
            DbError::ExecutionError(format!(
                "step for '{}' already executed",
                self.collection
            ))
        })?;
        let backup = self.store.backup_collection(&self.collection).await?;

        let applied = self
            .store
            .modify(&self.collection, |snapshot| {
                transform(snapshot)?;
                Ok(snapshot.clone())
            })
            .await;
        let (updated, ticket) = match applied {
            Ok(applied) => applied,
            Err(err) => {
                // Nothing was written; the backup is just litter now.
                if let Err(discard_err) = backup.discard().await {
                    event!(
                        Level::WARN,
                        collection = %self.collection,
                        error = %discard_err,
                        "discarding unused collection backup failed"
                    );
                }
                return Err(err);
            }
        };

        if let Err(err) = ticket.wait().await {
            // The cache already holds the new snapshot; undo it here since a
            // failed step is never rolled back by the coordinator.
            if let Err(restore_err) = self.store.restore_collection(&self.collection, backup).await {
                event!(
                    Level::ERROR,
                    collection = %self.collection,
                    error = %restore_err,
                    "restoring collection after failed write also failed"
                );
            }
            return Err(err);
        }

        self.backup = Some(backup);
        Ok(updated)
    }

    async fn rollback(&mut self) -> Result<()> {
        match self.backup.take() {
            Some(backup) => self.store.restore_collection(&self.collection, backup).await,
            None => Ok(()),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        match self.backup.take() {
            Some(backup) => backup.discard().await,
            None => Ok(()),
        }
    }
}
