use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event};

/// What happened to a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new snapshot replaced the cached one.
    Written,
    /// The cached snapshot was dropped and will be reloaded from disk.
    Invalidated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: String,
    pub kind: ChangeKind,
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Handle returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Observer {
    collection: Option<String>,
    callback: ChangeCallback,
}

/// Registry of collection-change callbacks.
///
/// Callbacks run synchronously on the writing task, in subscription order.
/// A panicking callback is logged and does not affect the others.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: Mutex<BTreeMap<SubscriptionId, Observer>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for one collection, or for all when `collection` is `None`.
    pub fn subscribe(&self, collection: Option<&str>, callback: ChangeCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut observers = self
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observers.insert(
            id,
            Observer {
                collection: collection.map(str::to_string),
                callback,
            },
        );
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self
            .observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        observers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.observers
            .lock()
            .map(|observers| observers.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, event: &ChangeEvent) {
        // Snapshot the matching callbacks so one may (un)subscribe re-entrantly.
        let callbacks: Vec<ChangeCallback> = {
            let observers = self
                .observers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            observers
                .values()
                .filter(|o| {
                    o.collection
                        .as_deref()
                        .is_none_or(|name| name == event.collection)
                })
                .map(|o| o.callback.clone())
                .collect()
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                event!(
                    Level::ERROR,
                    collection = %event.collection,
                    "collection change observer panicked"
                );
            }
        }
    }
}
