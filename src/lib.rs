// ============================================================================
// flatstore Library
// ============================================================================
//
// A file-backed document store: one pretty-printed JSON array per collection,
// served from an in-memory cache, flushed by a debouncing write coalescer,
// coordinated by advisory leases and compensating transactions, and queried
// through lazily built secondary indexes.
//
// ============================================================================

//! # Example
//!
//! ```no_run
//! use flatstore::{Engine, Pagination, Predicate, StoreConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> flatstore::Result<()> {
//!     let engine = Engine::open(StoreConfig::from_env()).await?;
//!
//!     let mut goals = engine.read("goals").await?;
//!     goals.push(flatstore::record_from_value(json!({"id": "g1", "userId": "u1"})).unwrap());
//!     engine.write("goals", goals)?;
//!
//!     let page = engine
//!         .query_by_filters("goals", &[Predicate::eq("userId", "u1")], Pagination::default(), None)
//!         .await?;
//!     println!("{} goal(s)", page.total);
//!
//!     engine.shutdown().await
//! }
//! ```

pub mod core;
pub mod facade;
pub mod index;
pub mod lock;
pub mod recovery;
pub mod storage;
pub mod transaction;

pub use core::{DbError, Record, Result, Snapshot, record_from_value, record_id};
pub use facade::Engine;
pub use index::{IndexRegistry, Page, Pagination, Predicate, Query, SortOrder, SortSpec};
pub use lock::{LeaseGuard, LeaseId, LockManager, LockReaper};
pub use recovery::{RecoveryReport, recover_interrupted_writes};
pub use storage::{ChangeEvent, ChangeKind, FlushTicket, Store, StoreConfig, StoreMetrics};
pub use transaction::{CollectionStep, FnStep, Step, Transaction};
