use super::collection::{Collection, PendingWrite, validate_collection_name};
use super::config::StoreConfig;
use super::metrics::StoreMetrics;
use super::observer::{ChangeCallback, ChangeEvent, ChangeKind, ObserverRegistry, SubscriptionId};
use super::persistence::{FileBackup, load_snapshot};
use crate::core::{DbError, Record, Result, Snapshot, record_id};
use super::coalescer::FlushTicket;
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{Level, event};

pub(crate) struct StoreInner {
    pub config: StoreConfig,
    collections: Mutex<HashMap<String, Arc<Collection>>>,
    pub observers: ObserverRegistry,
}

/// Per-collection read/write cache in front of the collection documents.
///
/// Reads are served from memory once a collection is loaded; writes replace
/// the cached snapshot synchronously and hand it to the write coalescer.
/// Cloning a `Store` is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Create a store over `config.data_dir`, creating the directory if needed.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        config.validate().map_err(DbError::ValidationFailure)?;
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(|err| {
                DbError::IoError(format!(
                    "Failed to create data directory '{}': {}",
                    config.data_dir.display(),
                    err
                ))
            })?;

        event!(Level::DEBUG, data_dir = %config.data_dir.display(), "store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                config,
                collections: Mutex::new(HashMap::new()),
                observers: ObserverRegistry::new(),
            }),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub(crate) fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        validate_collection_name(name)?;
        let mut collections = self.inner.collections.lock()?;
        let collection = collections.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Collection::new(
                name,
                self.inner.config.collection_path(name),
            ))
        });
        Ok(collection.clone())
    }

    pub(crate) fn all_collections(&self) -> Result<Vec<Arc<Collection>>> {
        let collections = self.inner.collections.lock()?;
        Ok(collections.values().cloned().collect())
    }

    /// Names of every collection this store has touched.
    pub fn collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .all_collections()?
            .iter()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Shared view of the cached snapshot, loading it on first access.
    pub(crate) async fn read_shared(&self, name: &str) -> Result<Arc<Snapshot>> {
        let collection = self.collection(name)?;
        {
            let mut state = collection.state();
            if let Some(snapshot) = state.snapshot.clone() {
                state.counters.hits += 1;
                return Ok(snapshot);
            }
        }

        let _load = collection.load_lock.lock().await;
        // A concurrent load or write may have populated the cache meanwhile.
        if let Some(snapshot) = collection.state().snapshot.clone() {
            return Ok(snapshot);
        }

        let started = Instant::now();
        let loaded = load_snapshot(&collection.path).await?;
        let elapsed = started.elapsed();

        let mut state = collection.state();
        state.counters.misses += 1;
        state.counters.loads += 1;
        state.counters.load_time += elapsed;
        state.touched = Instant::now();
        let snapshot = state
            .snapshot
            .get_or_insert_with(|| Arc::new(loaded))
            .clone();
        event!(
            Level::DEBUG,
            collection = %collection.name,
            records = snapshot.len(),
            "collection loaded"
        );
        Ok(snapshot)
    }

    /// Returns an independent copy of the collection's current snapshot.
    ///
    /// A missing document reads as an empty collection.
    pub async fn read(&self, name: &str) -> Result<Snapshot> {
        let shared = self.read_shared(name).await?;
        Ok(shared.as_ref().clone())
    }

    /// Replaces the collection's snapshot and queues it for flushing.
    ///
    /// Subsequent reads observe `snapshot` immediately. Two writers racing
    /// inside one batch window without a lease lose the earlier snapshot:
    /// batches keep only the last one queued.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn write(&self, name: &str, snapshot: Snapshot) -> Result<FlushTicket> {
        let handle = runtime_handle()?;
        let collection = self.collection(name)?;
        let ticket = {
            let mut state = collection.state();
            self.enqueue(&handle, &collection, &mut state, Arc::new(snapshot))
        };
        self.notify(name, ChangeKind::Written);
        Ok(ticket)
    }

    /// Applies `mutate` to a private copy of the snapshot and writes the
    /// result, all under the collection's state lock.
    ///
    /// Unlike a `read` followed by `write`, no other writer can slip in
    /// between. When `mutate` fails nothing is written.
    ///
    /// `mutate` runs with that lock held. It must not call `write`, `modify`
    /// or any other mutating method on the same collection, which would
    /// deadlock; other collections are fine.
    pub async fn modify<T, F>(&self, name: &str, mutate: F) -> Result<(T, FlushTicket)>
    where
        F: FnOnce(&mut Snapshot) -> Result<T>,
    {
        let handle = runtime_handle()?;
        self.read_shared(name).await?;
        let collection = self.collection(name)?;

        let result = {
            let mut state = collection.state();
            let mut working = match &state.snapshot {
                Some(snapshot) => snapshot.as_ref().clone(),
                // Invalidated between the load above and here.
                None => {
                    return Err(DbError::ExecutionError(format!(
                        "collection '{}' was invalidated during modify",
                        name
                    )));
                }
            };
            let value = mutate(&mut working)?;
            let ticket = self.enqueue(&handle, &collection, &mut state, Arc::new(working));
            (value, ticket)
        };
        self.notify(name, ChangeKind::Written);
        Ok(result)
    }

    fn enqueue(
        &self,
        handle: &Handle,
        collection: &Arc<Collection>,
        state: &mut super::collection::CollectionState,
        snapshot: Arc<Snapshot>,
    ) -> FlushTicket {
        let (done, rx) = oneshot::channel();
        state.snapshot = Some(snapshot.clone());
        state.dirty = true;
        state.touched = Instant::now();
        state.queue.push(PendingWrite { snapshot, done });

        if state.queue.len() >= self.inner.config.max_queue_size {
            state.cancel_timer();
            if !state.writing {
                self.spawn_flush_on(handle, collection.clone());
            }
        } else {
            self.arm_timer(handle, collection, state);
        }
        FlushTicket::new(rx)
    }

    pub async fn get_by_id(&self, name: &str, id: &str) -> Result<Option<Record>> {
        let snapshot = self.read_shared(name).await?;
        Ok(snapshot
            .iter()
            .find(|record| record_id(record).as_deref() == Some(id))
            .cloned())
    }

    /// Appends `record`. The record must carry an `id` not already present.
    pub async fn insert(&self, name: &str, record: Record) -> Result<Record> {
        let id = record_id(&record).ok_or_else(|| {
            DbError::ValidationFailure(format!("record for '{}' has no id", name))
        })?;
        let (inserted, _ticket) = self
            .modify(name, |snapshot| {
                if snapshot
                    .iter()
                    .any(|existing| record_id(existing).as_deref() == Some(id.as_str()))
                {
                    return Err(DbError::ValidationFailure(format!(
                        "{} '{}' already exists",
                        name, id
                    )));
                }
                snapshot.push(record.clone());
                Ok(record)
            })
            .await?;
        Ok(inserted)
    }

    /// Shallow-merges `patch` into the record with `id` and stamps `updatedAt`.
    pub async fn update(&self, name: &str, id: &str, patch: Record) -> Result<Record> {
        let (updated, _ticket) = self
            .modify(name, |snapshot| {
                let existing = snapshot
                    .iter_mut()
                    .find(|record| record_id(record).as_deref() == Some(id))
                    .ok_or_else(|| DbError::not_found(name, id))?;
                for (key, value) in patch {
                    if key != crate::core::record::ID_FIELD {
                        existing.insert(key, value);
                    }
                }
                existing.insert(
                    "updatedAt".to_string(),
                    Utc::now()
                        .to_rfc3339_opts(SecondsFormat::Millis, true)
                        .into(),
                );
                Ok(existing.clone())
            })
            .await?;
        Ok(updated)
    }

    pub async fn delete(&self, name: &str, id: &str) -> Result<Record> {
        let (removed, _ticket) = self
            .modify(name, |snapshot| {
                let position = snapshot
                    .iter()
                    .position(|record| record_id(record).as_deref() == Some(id))
                    .ok_or_else(|| DbError::not_found(name, id))?;
                Ok(snapshot.remove(position))
            })
            .await?;
        Ok(removed)
    }

    /// Drops the cached snapshot so the next read reloads from disk.
    ///
    /// Pending writes are flushed first; an invalidation never discards data.
    pub async fn invalidate_cache(&self, name: &str) -> Result<()> {
        let collection = self.collection(name)?;
        self.drain(&collection).await?;
        {
            let mut state = collection.state();
            if state.dirty || state.writing {
                // Written to again while draining; that write stays authoritative.
                return Ok(());
            }
            state.snapshot = None;
        }
        self.notify(name, ChangeKind::Invalidated);
        Ok(())
    }

    /// Evicts clean snapshots idle for longer than `cache_idle_ttl`.
    /// Returns how many collections were evicted.
    pub fn evict_idle(&self) -> Result<usize> {
        let Some(ttl) = self.inner.config.cache_idle_ttl else {
            return Ok(0);
        };
        let mut evicted = Vec::new();
        for collection in self.all_collections()? {
            let mut state = collection.state();
            if state.snapshot.is_some()
                && !state.dirty
                && !state.writing
                && state.touched.elapsed() >= ttl
            {
                state.snapshot = None;
                evicted.push(collection.name.clone());
            }
        }
        for name in &evicted {
            event!(Level::DEBUG, collection = %name, "idle collection evicted");
            self.notify(name, ChangeKind::Invalidated);
        }
        Ok(evicted.len())
    }

    /// Flushes the collection and copies its document to `<file>.bak`.
    pub async fn backup_collection(&self, name: &str) -> Result<FileBackup> {
        let collection = self.collection(name)?;
        self.drain(&collection).await?;
        FileBackup::create(&collection.path).await
    }

    /// Puts the backed-up content back into both cache and file, then
    /// deletes the backup.
    pub async fn restore_collection(&self, name: &str, backup: FileBackup) -> Result<()> {
        let snapshot = backup.read().await?;
        self.write(name, snapshot)?.wait().await?;
        backup.discard().await
    }

    pub fn subscribe(&self, collection: Option<&str>, callback: ChangeCallback) -> SubscriptionId {
        self.inner.observers.subscribe(collection, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    fn notify(&self, name: &str, kind: ChangeKind) {
        self.inner.observers.notify(&ChangeEvent {
            collection: name.to_string(),
            kind,
        });
    }

    /// True while the collection holds content not yet on disk.
    pub fn is_dirty(&self, name: &str) -> Result<bool> {
        let collection = self.collection(name)?;
        let state = collection.state();
        Ok(state.dirty)
    }

    /// Number of writes waiting for the next flush of `name`.
    pub fn pending_writes(&self, name: &str) -> Result<usize> {
        let collection = self.collection(name)?;
        let state = collection.state();
        Ok(state.queue.len())
    }

    /// RFC 3339 time of the last successful flush of `name`.
    pub fn last_write(&self, name: &str) -> Result<Option<String>> {
        let collection = self.collection(name)?;
        let state = collection.state();
        Ok(state
            .last_write
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true)))
    }

    pub fn metrics(&self) -> Result<StoreMetrics> {
        let mut metrics = StoreMetrics::default();
        for collection in self.all_collections()? {
            let stats = collection.state().counters.stats();
            metrics.collections.insert(collection.name.clone(), stats);
        }
        Ok(metrics)
    }

    pub fn reset_metrics(&self) -> Result<()> {
        for collection in self.all_collections()? {
            collection.state().counters = Default::default();
        }
        Ok(())
    }
}

fn runtime_handle() -> Result<Handle> {
    Handle::try_current().map_err(|err| {
        DbError::ExecutionError(format!("store writes need a Tokio runtime: {}", err))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record_from_value;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: serde_json::Value) -> Record {
        record_from_value(value).unwrap()
    }

    async fn open(dir: &TempDir) -> Store {
        Store::open(StoreConfig::new(dir.path()).batch_delay(std::time::Duration::from_millis(20)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_read_missing_collection() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        assert!(store.read("goals").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copies_are_independent() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.write("goals", vec![record(json!({"id": "g1"}))]).unwrap();

        let mut copy = store.read("goals").await.unwrap();
        copy[0].insert("id".into(), json!("mutated"));
        copy.push(record(json!({"id": "g2"})));

        let fresh = store.read("goals").await.unwrap();
        assert_eq!(fresh, vec![record(json!({"id": "g1"}))]);
    }

    #[tokio::test]
    async fn test_insert_update_delete() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        store.insert("users", record(json!({"id": "u1", "name": "Ann"}))).await.unwrap();
        let dup = store.insert("users", record(json!({"id": "u1"}))).await;
        assert!(matches!(dup, Err(DbError::ValidationFailure(_))));

        let updated = store
            .update("users", "u1", record(json!({"name": "Anna", "id": "ignored"})))
            .await
            .unwrap();
        assert_eq!(updated["name"], json!("Anna"));
        assert_eq!(updated["id"], json!("u1"));
        assert!(updated.contains_key("updatedAt"));

        let missing = store.update("users", "nope", Record::new()).await;
        assert!(matches!(missing, Err(DbError::NotFound { .. })));

        let removed = store.delete("users", "u1").await.unwrap();
        assert_eq!(removed["name"], json!("Anna"));
        assert!(store.get_by_id("users", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_modify_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let result: Result<((), FlushTicket)> = store
            .modify("users", |snapshot| {
                snapshot.push(record(json!({"id": "half"})));
                Err(DbError::ValidationFailure("rejected".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(store.read("users").await.unwrap().is_empty());
        assert!(!store.is_dirty("users").unwrap());
    }

    #[tokio::test]
    async fn test_modify_may_write_other_collections() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let audit = store.clone();
        let (count, _ticket) = store
            .modify("users", |snapshot| {
                snapshot.push(record(json!({"id": "u1"})));
                audit.write("audit", vec![record(json!({"id": "a1", "user": "u1"}))])?;
                Ok(snapshot.len())
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.read("audit").await.unwrap().len(), 1);
        store.flush_all().await.unwrap();
        assert!(!store.is_dirty("users").unwrap());
        assert!(!store.is_dirty("audit").unwrap());
    }

    #[tokio::test]
    async fn test_hits_and_misses() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store.read("goals").await.unwrap();
        store.read("goals").await.unwrap();
        store.read("goals").await.unwrap();

        let metrics = store.metrics().unwrap();
        let goals = metrics.collection("goals").unwrap();
        assert_eq!(goals.misses, 1);
        assert_eq!(goals.hits, 2);
        assert_eq!(goals.loads, 1);

        store.reset_metrics().unwrap();
        assert_eq!(store.metrics().unwrap().collection("goals").unwrap().hits, 0);
    }

    #[tokio::test]
    async fn test_evict_idle_skips_dirty() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(
            StoreConfig::new(dir.path())
                .batch_delay(std::time::Duration::from_secs(60))
                .cache_idle_ttl(Some(std::time::Duration::ZERO)),
        )
        .await
        .unwrap();

        store.read("clean").await.unwrap();
        store.write("dirty", vec![record(json!({"id": 1}))]).unwrap();

        assert_eq!(store.evict_idle().unwrap(), 1);
        assert_eq!(store.read("dirty").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        assert!(matches!(
            store.read("../escape").await,
            Err(DbError::ValidationFailure(_))
        ));
    }
}
