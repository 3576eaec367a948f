pub mod coalescer;
pub(crate) mod collection;
pub mod config;
pub mod metrics;
pub mod observer;
pub mod persistence;
pub mod store;

pub use coalescer::FlushTicket;
pub use config::StoreConfig;
pub use metrics::{CollectionMetrics, StoreMetrics};
pub use observer::{ChangeCallback, ChangeEvent, ChangeKind, SubscriptionId};
pub use persistence::FileBackup;
pub use store::Store;
