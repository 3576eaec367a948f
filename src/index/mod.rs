// ============================================================================
// Secondary Index Module
// ============================================================================
//
// Per-field position indexes over one cached collection snapshot, plus the
// filtered, sorted and paginated queries answered from them.
//
// ============================================================================

pub mod builder;
pub mod query;
pub mod sort;

pub use builder::{FieldIndex, IndexSet};
pub use query::{IndexRegistry, Page, Pagination, Predicate, Query};
pub use sort::{NullOrdering, RecordComparator, SortOrder, SortSpec};
