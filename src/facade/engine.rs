use crate::core::{Record, Result, Snapshot};
use crate::index::{IndexRegistry, Page, Pagination, Predicate, SortSpec};
use crate::lock::{LockManager, LockReaper};
use crate::recovery::{RecoveryReport, recover_interrupted_writes};
use crate::storage::{ChangeCallback, FlushTicket, Store, StoreConfig, SubscriptionId};
use crate::transaction::{Step, run_steps};
use std::future::Future;
use std::time::Duration;
use tracing::{Level, event};

/// The storage engine as domain code consumes it.
///
/// Bundles the cache, lock manager, index registry and lease reaper over one
/// data directory. Writes made through the engine always invalidate the
/// collection's index; the registry also watches the store, so writes made
/// directly on [`Engine::store`] invalidate it too.
pub struct Engine {
    store: Store,
    locks: LockManager,
    indexes: IndexRegistry,
    reaper: Option<LockReaper>,
}

impl Engine {
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let locks = LockManager::from_config(&config);
        let sweep = config.lock_sweep_interval;
        let store = Store::open(config).await?;

        let indexes = IndexRegistry::new(store.clone());
        indexes.watch();
        let reaper = LockReaper::spawn(locks.clone(), sweep);

        event!(Level::INFO, data_dir = %store.config().data_dir.display(), "engine opened");
        Ok(Self {
            store,
            locks,
            indexes,
            reaper: Some(reaper),
        })
    }

    /// Sweeps interrupted writes out of the data directory, then opens it.
    pub async fn recover_and_open(config: StoreConfig) -> Result<(Self, RecoveryReport)> {
        let report = recover_interrupted_writes(&config.data_dir, &config.file_extension).await?;
        let engine = Self::open(config).await?;
        Ok((engine, report))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn indexes(&self) -> &IndexRegistry {
        &self.indexes
    }

    pub async fn read(&self, collection: &str) -> Result<Snapshot> {
        self.store.read(collection).await
    }

    pub fn write(&self, collection: &str, snapshot: Snapshot) -> Result<FlushTicket> {
        let ticket = self.store.write(collection, snapshot)?;
        self.indexes.invalidate(collection);
        Ok(ticket)
    }

    /// Runs `operation` under the lease on `kind:id`.
    ///
    /// `wait` bounds the wait for the lease and defaults to the configured
    /// lock timeout. Lease lifetimes follow `LockManager::acquire`.
    pub async fn with_resource_lock<T, F, Fut>(
        &self,
        kind: &str,
        id: &str,
        holder: &str,
        wait: Option<Duration>,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let wait = wait.unwrap_or_else(|| self.locks.default_timeout());
        self.locks.with_lock(kind, id, holder, wait, operation).await
    }

    pub async fn run<T: Send + 'static>(&self, steps: Vec<Box<dyn Step<T>>>) -> Result<Vec<T>> {
        run_steps(steps).await
    }

    pub async fn query_by_filters(
        &self,
        collection: &str,
        predicates: &[Predicate],
        pagination: Pagination,
        sort: Option<&SortSpec>,
    ) -> Result<Page<Record>> {
        self.indexes
            .query_by_filters(collection, predicates, pagination, sort)
            .await
    }

    pub fn invalidate_index(&self, collection: &str) -> bool {
        self.indexes.invalidate(collection)
    }

    pub async fn flush_all(&self) -> Result<()> {
        self.store.flush_all().await
    }

    pub fn subscribe(&self, collection: Option<&str>, callback: ChangeCallback) -> SubscriptionId {
        self.store.subscribe(collection, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    /// Drains every pending write and stops the lease reaper.
    pub async fn shutdown(mut self) -> Result<()> {
        let flushed = self.store.flush_all().await;
        if let Some(reaper) = self.reaper.take() {
            reaper.stop().await?;
        }
        event!(Level::INFO, "engine shut down");
        flushed
    }
}
