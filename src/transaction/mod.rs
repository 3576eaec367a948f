// ============================================================================
// Transaction Module
// ============================================================================
//
// Compensation-based transactions: ordered execute/rollback steps, undone in
// reverse order when a later step fails.
//
// Design Patterns Used:
// - Command Pattern: each step carries its own undo
// - Memento: backup copies of collection documents for file-level undo
//
// ============================================================================

pub mod coordinator;
pub mod step;

pub use coordinator::{Transaction, run_steps};
pub use step::{CollectionStep, FnStep, Step};
