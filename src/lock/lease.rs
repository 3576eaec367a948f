use super::manager::LockManager;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Shortest lifetime a lease is ever granted with.
pub const MIN_LEASE_TTL: Duration = Duration::from_millis(1);

/// Identifier of one granted lease. A fresh id is minted on every grant, so
/// a stale id can never release somebody else's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(Uuid);

impl LeaseId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An exclusive, time-bounded grant of one resource.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: LeaseId,
    pub holder: String,
    pub acquired_at: Instant,
    pub expires_at: Instant,
}

impl Lease {
    pub(crate) fn grant(holder: &str, ttl: Duration) -> Self {
        let ttl = ttl.max(MIN_LEASE_TTL);
        let now = Instant::now();
        Self {
            id: LeaseId::new(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at < now
    }
}

/// Scoped lease: released when dropped, including during unwinding.
pub struct LeaseGuard {
    manager: LockManager,
    kind: String,
    key: String,
    lease_id: LeaseId,
    released: bool,
}

impl LeaseGuard {
    pub(crate) fn new(manager: LockManager, kind: &str, key: &str, lease_id: LeaseId) -> Self {
        Self {
            manager,
            kind: kind.to_string(),
            key: key.to_string(),
            lease_id,
            released: false,
        }
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    /// Releases now. Returns false when the lease had already expired and
    /// been handed to someone else.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.manager.release(&self.kind, &self.key, self.lease_id)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.released {
            self.manager.release(&self.kind, &self.key, self.lease_id);
        }
    }
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("lease_id", &self.lease_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_ttl_grant_is_live() {
        let lease = Lease::grant("a", Duration::ZERO);
        assert!(lease.expires_at > lease.acquired_at);
        assert!(!lease.is_expired(lease.acquired_at));
        assert!(lease.is_expired(lease.expires_at + Duration::from_millis(1)));
    }
}
