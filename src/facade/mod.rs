// ============================================================================
// Engine Facade
// ============================================================================
//
// One entry point over the store, locks, transactions and indexes: the
// contract domain modules are written against.
//
// ============================================================================

pub mod engine;

pub use engine::Engine;
