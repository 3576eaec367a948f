pub mod error;
pub mod record;

pub use error::{DbError, Result};
pub use record::{Record, Snapshot, compare_values, parse_timestamp, record_from_value, record_id};
