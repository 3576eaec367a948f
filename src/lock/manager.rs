// ============================================================================
// Lock Manager
// ============================================================================
//
// Advisory, process-local leases keyed by "<kind>:<key>". One holder per
// resource, waiters served strictly in arrival order, and every lease carries
// an absolute expiry so a crashed or stuck holder cannot wedge the resource.
//
// ============================================================================

use super::lease::{Lease, LeaseGuard, LeaseId};
use crate::core::{DbError, Result};
use crate::storage::StoreConfig;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{Level, event};

pub const FILE_LOCK_KIND: &str = "file";

struct Waiter {
    id: u64,
    holder: String,
    ttl: Duration,
    tx: oneshot::Sender<LeaseId>,
}

#[derive(Default)]
struct Slot {
    lease: Option<Lease>,
    waiters: VecDeque<Waiter>,
}

impl Slot {
    /// Hands the resource to the first waiter still listening.
    fn promote(&mut self, resource: &str) {
        while let Some(waiter) = self.waiters.pop_front() {
            let lease = Lease::grant(&waiter.holder, waiter.ttl);
            let lease_id = lease.id;
            if waiter.tx.send(lease_id).is_ok() {
                event!(
                    Level::DEBUG,
                    resource,
                    holder = %lease.holder,
                    lease_id = %lease_id,
                    "lease handed to waiter"
                );
                self.lease = Some(lease);
                return;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.lease.is_none() && self.waiters.is_empty()
    }
}

struct LockInner {
    slots: Mutex<HashMap<String, Slot>>,
    next_waiter: AtomicU64,
    default_timeout: Duration,
}

/// Grants exclusive, expiring leases on named resources.
///
/// Locks are cooperative: nothing stops code from touching a resource
/// without a lease. Any read-modify-write that must not interleave with
/// another writer belongs inside `with_lock`.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockInner>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn resource_key(kind: &str, key: &str) -> String {
    format!("{}:{}", kind, key)
}

impl LockManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(LockInner {
                slots: Mutex::new(HashMap::new()),
                next_waiter: AtomicU64::new(1),
                default_timeout,
            }),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.lock_timeout)
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquires the lease on `kind:key` for `holder`.
    ///
    /// Grants immediately when the resource is free, otherwise queues behind
    /// earlier waiters. Fails with `LockTimeout` if not granted within
    /// `wait`. An immediate grant lives for `wait`; a grant handed over from
    /// the queue, or one requested with a zero `wait`, lives for the
    /// manager's default timeout.
    pub async fn acquire(
        &self,
        kind: &str,
        key: &str,
        holder: &str,
        wait: Duration,
    ) -> Result<LeaseId> {
        let default_ttl = self.inner.default_timeout;
        let immediate_ttl = if wait.is_zero() { default_ttl } else { wait };
        self.acquire_inner(kind, key, holder, wait, immediate_ttl, default_ttl)
            .await
    }

    /// Like `acquire`, but every grant lives for exactly `ttl`.
    pub async fn acquire_with_ttl(
        &self,
        kind: &str,
        key: &str,
        holder: &str,
        wait: Duration,
        ttl: Duration,
    ) -> Result<LeaseId> {
        self.acquire_inner(kind, key, holder, wait, ttl, ttl).await
    }

    async fn acquire_inner(
        &self,
        kind: &str,
        key: &str,
        holder: &str,
        wait: Duration,
        immediate_ttl: Duration,
        queued_ttl: Duration,
    ) -> Result<LeaseId> {
        let resource = resource_key(kind, key);
        let (waiter_id, mut rx) = {
            let mut slots = self.slots();
            let slot = slots.entry(resource.clone()).or_default();

            if let Some(lease) = &slot.lease {
                if lease.is_expired(Instant::now()) {
                    event!(
                        Level::WARN,
                        resource = %resource,
                        holder = %lease.holder,
                        "reclaiming expired lease"
                    );
                    slot.lease = None;
                    slot.promote(&resource);
                }
            }

            if slot.lease.is_none() && slot.waiters.is_empty() {
                let lease = Lease::grant(holder, immediate_ttl);
                let lease_id = lease.id;
                slot.lease = Some(lease);
                event!(Level::DEBUG, resource = %resource, holder, lease_id = %lease_id, "lease granted");
                return Ok(lease_id);
            }

            let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(Waiter {
                id,
                holder: holder.to_string(),
                ttl: queued_ttl,
                tx,
            });
            (id, rx)
        };

        match timeout(wait, &mut rx).await {
            Ok(Ok(lease_id)) => Ok(lease_id),
            Ok(Err(_)) => Err(DbError::LockError(format!(
                "lease queue for '{}' was dropped",
                resource
            ))),
            Err(_) => {
                let mut slots = self.slots();
                let still_queued = slots
                    .get_mut(&resource)
                    .and_then(|slot| {
                        let position = slot.waiters.iter().position(|w| w.id == waiter_id)?;
                        slot.waiters.remove(position)
                    })
                    .is_some();
                if !still_queued {
                    // Granted between the deadline and this check.
                    if let Ok(lease_id) = rx.try_recv() {
                        return Ok(lease_id);
                    }
                }
                if slots.get(&resource).is_some_and(Slot::is_idle) {
                    slots.remove(&resource);
                }
                event!(Level::WARN, resource = %resource, holder, "lease wait timed out");
                Err(DbError::LockTimeout {
                    kind: kind.to_string(),
                    key: key.to_string(),
                })
            }
        }
    }

    /// Releases `lease_id`. Returns false, changing nothing, when the id is
    /// not the live lease (already released, or expired and re-granted).
    pub fn release(&self, kind: &str, key: &str, lease_id: LeaseId) -> bool {
        let resource = resource_key(kind, key);
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&resource) else {
            return false;
        };
        if slot.lease.as_ref().map(|lease| lease.id) != Some(lease_id) {
            return false;
        }
        slot.lease = None;
        slot.promote(&resource);
        if slot.is_idle() {
            slots.remove(&resource);
        }
        true
    }

    /// Acquires and wraps the lease in a guard that releases on drop.
    pub async fn acquire_guard(
        &self,
        kind: &str,
        key: &str,
        holder: &str,
        wait: Duration,
    ) -> Result<LeaseGuard> {
        let lease_id = self.acquire(kind, key, holder, wait).await?;
        Ok(LeaseGuard::new(self.clone(), kind, key, lease_id))
    }

    /// Runs `operation` while holding the lease on `kind:key`.
    ///
    /// The lease is released on every exit path: success, error, or panic.
    pub async fn with_lock<T, F, Fut>(
        &self,
        kind: &str,
        key: &str,
        holder: &str,
        wait: Duration,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire_guard(kind, key, holder, wait).await?;
        let outcome = operation().await;
        if !guard.release() {
            event!(
                Level::WARN,
                resource = %resource_key(kind, key),
                holder,
                "lease expired before the guarded operation finished"
            );
        }
        outcome
    }

    /// `with_lock` over the file namespace.
    pub async fn with_file_lock<T, F, Fut>(
        &self,
        filename: &str,
        holder: &str,
        wait: Duration,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_lock(FILE_LOCK_KIND, filename, holder, wait, operation)
            .await
    }

    /// Drops every expired lease and promotes the next waiter of each.
    /// Returns the number of leases reclaimed.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots();
        let mut reclaimed = 0;
        for (resource, slot) in slots.iter_mut() {
            let expired = slot.lease.as_ref().is_some_and(|lease| lease.is_expired(now));
            if expired {
                if let Some(lease) = slot.lease.take() {
                    event!(
                        Level::WARN,
                        resource = %resource,
                        holder = %lease.holder,
                        "reclaiming expired lease"
                    );
                }
                reclaimed += 1;
                slot.promote(resource);
            }
        }
        slots.retain(|_, slot| !slot.is_idle());
        reclaimed
    }

    pub fn is_locked(&self, kind: &str, key: &str) -> bool {
        self.slots()
            .get(&resource_key(kind, key))
            .is_some_and(|slot| slot.lease.is_some())
    }

    /// Holder tag of the live lease, if any.
    pub fn holder(&self, kind: &str, key: &str) -> Option<String> {
        self.slots()
            .get(&resource_key(kind, key))
            .and_then(|slot| slot.lease.as_ref().map(|lease| lease.holder.clone()))
    }

    /// Number of live waiters queued on `kind:key`.
    pub fn queue_len(&self, kind: &str, key: &str) -> usize {
        self.slots()
            .get(&resource_key(kind, key))
            .map(|slot| slot.waiters.iter().filter(|w| !w.tx.is_closed()).count())
            .unwrap_or(0)
    }
}
