use super::metrics::CollectionCounters;
use crate::core::{DbError, Result, Snapshot};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

/// A queued flush request: the full replacement snapshot plus its waiter.
pub(crate) struct PendingWrite {
    pub snapshot: Arc<Snapshot>,
    pub done: oneshot::Sender<Result<()>>,
}

pub(crate) struct CollectionState {
    /// Authoritative snapshot once populated.
    pub snapshot: Option<Arc<Snapshot>>,
    pub queue: Vec<PendingWrite>,
    /// Cache holds content that has not reached disk yet.
    pub dirty: bool,
    /// A flush of this collection is in flight.
    pub writing: bool,
    pub timer: Option<JoinHandle<()>>,
    /// Time of the last successful flush.
    pub last_write: Option<DateTime<Utc>>,
    /// Last load or write, for idle eviction.
    pub touched: Instant,
    pub counters: CollectionCounters,
}

impl CollectionState {
    fn new() -> Self {
        Self {
            snapshot: None,
            queue: Vec::new(),
            dirty: false,
            writing: false,
            timer: None,
            last_write: None,
            touched: Instant::now(),
            counters: CollectionCounters::default(),
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// One file-backed collection.
pub(crate) struct Collection {
    pub name: String,
    pub path: PathBuf,
    state: Mutex<CollectionState>,
    /// Serializes cold loads so one disk read populates the cache.
    pub load_lock: tokio::sync::Mutex<()>,
    /// Signalled whenever a flush finishes.
    pub flushed: Notify,
}

impl Collection {
    pub fn new(name: &str, path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            path,
            state: Mutex::new(CollectionState::new()),
            load_lock: tokio::sync::Mutex::new(()),
            flushed: Notify::new(),
        }
    }

    /// State guard. Critical sections never await or panic, so a poisoned
    /// lock still holds consistent data.
    pub fn state(&self) -> MutexGuard<'_, CollectionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Collection names become file names; keep them to one path segment.
pub(crate) fn validate_collection_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DbError::ValidationFailure(
            "collection name must not be empty".to_string(),
        ));
    }
    if name.contains(['/', '\\']) || name.starts_with('.') || name.contains("..") {
        return Err(DbError::ValidationFailure(format!(
            "invalid collection name '{}'",
            name
        )));
    }
    Ok(())
}
