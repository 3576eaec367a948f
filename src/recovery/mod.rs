// ============================================================================
// Crash Recovery Module
// ============================================================================
//
// Offline maintenance over a data directory: promote or drop temp files left
// by interrupted flushes, and summarize what is on disk. Run before a store
// is opened on the directory, never alongside one.
//
// ============================================================================

pub mod inspect;
pub mod sweeper;

pub use inspect::{CollectionSummary, inspect_data_dir};
pub use sweeper::{FailedArtifact, RecoveredArtifact, RecoveryReport, recover_interrupted_writes};
