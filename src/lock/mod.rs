// ============================================================================
// Resource Lock Module
// ============================================================================
//
// Cooperative single-holder leases with FIFO waiters, expiry-based
// reclamation and a scoped `with_lock` form.
//
// ============================================================================

pub mod lease;
pub mod manager;
pub mod reaper;

pub use lease::{Lease, LeaseGuard, LeaseId};
pub use manager::{FILE_LOCK_KIND, LockManager};
pub use reaper::LockReaper;
