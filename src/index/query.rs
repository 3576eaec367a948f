// ============================================================================
// src/index/query.rs - Lazy index registry and filtered queries
// ============================================================================
//
// The registry keeps at most one `IndexSet` per collection. Queries build it
// on first use; `invalidate` drops it. A set is never patched: a write that
// is not followed by `invalidate` leaves queries answering from the snapshot
// the set was built from until the next invalidation.
//
// `watch()` hooks the registry to store change events so every write and
// cache invalidation drops the matching index automatically.
//
// ============================================================================

use super::builder::IndexSet;
use super::sort::{RecordComparator, SortSpec};
use crate::core::{DbError, Record, Result, parse_timestamp};
use crate::storage::{ChangeEvent, Store, SubscriptionId};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{Level, event};

/// One filter condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Field equals `value`; an array field matches when any element does.
    Eq { field: String, value: Value },
    /// Record timestamp inside `[from, to]`; a missing bound is open.
    DateRange {
        from: Option<String>,
        to: Option<String>,
    },
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn date_range(from: Option<&str>, to: Option<&str>) -> Self {
        Self::DateRange {
            from: from.map(str::to_string),
            to: to.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Pagination {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 10,
            offset: 0,
        }
    }
}

/// One page of a filtered, sorted result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matches before pagination
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

/// Builder bundling predicates, pagination and sort.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub predicates: Vec<Predicate>,
    pub pagination: Pagination,
    pub sort: Option<SortSpec>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate::eq(field, value));
        self
    }

    pub fn date_range(mut self, from: Option<&str>, to: Option<&str>) -> Self {
        self.predicates.push(Predicate::date_range(from, to));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.pagination.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.pagination.offset = offset;
        self
    }

    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }
}

#[derive(Default)]
struct IndexTable {
    sets: HashMap<String, Arc<IndexSet>>,
    /// Bumped by every invalidation; a build started before a bump is not cached.
    generations: HashMap<String, u64>,
}

impl IndexTable {
    fn generation(&self, collection: &str) -> u64 {
        self.generations.get(collection).copied().unwrap_or(0)
    }

    fn drop_index(&mut self, collection: &str) -> bool {
        *self.generations.entry(collection.to_string()).or_default() += 1;
        self.sets.remove(collection).is_some()
    }
}

struct RegistryInner {
    store: Store,
    table: Mutex<IndexTable>,
    watch: Mutex<Option<SubscriptionId>>,
}

impl RegistryInner {
    fn table(&self) -> MutexGuard<'_, IndexTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn watch_slot(&self) -> MutexGuard<'_, Option<SubscriptionId>> {
        self.watch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let slot = match self.watch.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(id) = slot {
            self.store.unsubscribe(id);
        }
    }
}

/// Per-collection secondary indexes over a [`Store`].
///
/// Cloning shares the same indexes.
#[derive(Clone)]
pub struct IndexRegistry {
    inner: Arc<RegistryInner>,
}

impl IndexRegistry {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                table: Mutex::new(IndexTable::default()),
                watch: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Scans the cached snapshot once and replaces the collection's index.
    ///
    /// Fields already indexed for the collection are kept, so repeated
    /// builds only ever widen the set.
    pub async fn build_index<S: AsRef<str>>(
        &self,
        collection: &str,
        fields: &[S],
    ) -> Result<Arc<IndexSet>> {
        let generation = self.inner.table().generation(collection);
        let snapshot = self.inner.store.read_shared(collection).await?;

        let mut wanted: BTreeSet<String> = fields.iter().map(|f| f.as_ref().to_string()).collect();
        if let Some(existing) = self.inner.table().sets.get(collection) {
            wanted.extend(existing.fields());
        }
        let wanted: Vec<String> = wanted.into_iter().collect();

        let set = Arc::new(IndexSet::build(
            snapshot,
            &wanted,
            &self.inner.store.config().date_fields,
        ));
        event!(
            Level::DEBUG,
            collection,
            fields = ?wanted,
            records = set.len(),
            "index built"
        );

        let mut table = self.inner.table();
        if table.generation(collection) == generation {
            table.sets.insert(collection.to_string(), set.clone());
        }
        Ok(set)
    }

    /// The cached index, if any. Never builds.
    pub fn cached(&self, collection: &str) -> Option<Arc<IndexSet>> {
        self.inner.table().sets.get(collection).cloned()
    }

    /// Drops the collection's index. Returns whether one existed.
    pub fn invalidate(&self, collection: &str) -> bool {
        let dropped = self.inner.table().drop_index(collection);
        if dropped {
            event!(Level::DEBUG, collection, "index invalidated");
        }
        dropped
    }

    /// Subscribes to store change events so writes invalidate indexes.
    /// Returns false if already watching.
    pub fn watch(&self) -> bool {
        let mut slot = self.inner.watch_slot();
        if slot.is_some() {
            return false;
        }
        let weak = Arc::downgrade(&self.inner);
        let id = self.inner.store.subscribe(
            None,
            Arc::new(move |change: &ChangeEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.table().drop_index(&change.collection);
                }
            }),
        );
        *slot = Some(id);
        true
    }

    pub fn unwatch(&self) -> bool {
        match self.inner.watch_slot().take() {
            Some(id) => self.inner.store.unsubscribe(id),
            None => false,
        }
    }

    pub fn is_watching(&self) -> bool {
        self.inner.watch_slot().is_some()
    }

    async fn ensure(&self, collection: &str, fields: &[&str]) -> Result<Arc<IndexSet>> {
        if let Some(set) = self.cached(collection) {
            if fields.iter().all(|f| set.has_field(f)) {
                return Ok(set);
            }
        }
        self.build_index(collection, fields).await
    }

    /// Positions in snapshot order whose `field` matches `value`.
    pub async fn positions_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<usize>> {
        let set = self.ensure(collection, &[field]).await?;
        Ok(set
            .positions(field, value)
            .map(<[usize]>::to_vec)
            .unwrap_or_default())
    }

    pub async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        let set = self.ensure(collection, &[field]).await?;
        let positions = set.positions(field, value).unwrap_or(&[]);
        Ok(records_at(&set, positions.iter().copied()))
    }

    /// Records whose timestamp lies in `[from, to]`, in snapshot order.
    pub async fn query_by_date_range(
        &self,
        collection: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<Vec<Record>> {
        let (from, to) = (parse_bound(from)?, parse_bound(to)?);
        let set = self.ensure(collection, &[]).await?;
        Ok(records_at(&set, set.positions_in_range(from, to)))
    }

    /// Intersects `predicates` (all records when empty), sorts, then paginates.
    ///
    /// `sort` defaults to newest first by `date`.
    pub async fn query_by_filters(
        &self,
        collection: &str,
        predicates: &[Predicate],
        pagination: Pagination,
        sort: Option<&SortSpec>,
    ) -> Result<Page<Record>> {
        let fields: Vec<&str> = predicates
            .iter()
            .filter_map(|p| match p {
                Predicate::Eq { field, .. } => Some(field.as_str()),
                Predicate::DateRange { .. } => None,
            })
            .collect();
        let set = self.ensure(collection, &fields).await?;

        let mut matched: Option<Vec<usize>> = None;
        for predicate in predicates {
            let positions = match predicate {
                Predicate::Eq { field, value } => {
                    set.positions(field, value).unwrap_or(&[]).to_vec()
                }
                Predicate::DateRange { from, to } => set.positions_in_range(
                    parse_bound(from.as_deref())?,
                    parse_bound(to.as_deref())?,
                ),
            };
            matched = Some(match matched {
                None => positions,
                Some(current) => intersect(&current, &positions),
            });
        }
        let positions = matched.unwrap_or_else(|| (0..set.len()).collect());

        let mut refs: Vec<&Record> = positions.iter().filter_map(|&p| set.record(p)).collect();
        let default_sort = SortSpec::default();
        let spec = sort.unwrap_or(&default_sort);
        RecordComparator::new(spec, &self.inner.store.config().date_fields).sort(&mut refs);

        let total = refs.len();
        let items = refs
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit)
            .cloned()
            .collect();
        Ok(Page {
            items,
            total,
            limit: pagination.limit,
            offset: pagination.offset,
            has_more: pagination.offset.saturating_add(pagination.limit) < total,
        })
    }

    pub async fn query(&self, collection: &str, query: &Query) -> Result<Page<Record>> {
        self.query_by_filters(
            collection,
            &query.predicates,
            query.pagination,
            query.sort.as_ref(),
        )
        .await
    }
}

fn records_at(set: &IndexSet, positions: impl IntoIterator<Item = usize>) -> Vec<Record> {
    positions
        .into_iter()
        .filter_map(|p| set.record(p).cloned())
        .collect()
}

fn parse_bound(bound: Option<&str>) -> Result<Option<i64>> {
    match bound {
        None => Ok(None),
        Some(raw) => parse_timestamp(&Value::String(raw.to_string()))
            .map(Some)
            .ok_or_else(|| DbError::ValidationFailure(format!("invalid date bound '{}'", raw))),
    }
}

/// Intersection of two ascending position lists.
fn intersect(a: &[usize], b: &[usize]) -> Vec<usize> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record_from_value;
    use crate::storage::StoreConfig;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_intersect_sorted() {
        assert_eq!(intersect(&[0, 2, 4, 7], &[1, 2, 3, 7, 9]), vec![2, 7]);
        assert!(intersect(&[1, 2], &[]).is_empty());
    }

    #[test]
    fn test_bad_date_bound_rejected() {
        assert!(matches!(
            parse_bound(Some("not a date")),
            Err(DbError::ValidationFailure(_))
        ));
        assert_eq!(parse_bound(None).unwrap(), None);
    }

    #[test]
    fn test_pagination_defaults() {
        let q = Query::new();
        assert_eq!(q.pagination, Pagination::new(10, 0));
        assert!(q.sort.is_none());
    }

    #[tokio::test]
    async fn test_build_widens_fields() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::new(dir.path())).await.unwrap();
        store
            .write(
                "logs",
                vec![record_from_value(json!({"id": "1", "userId": "u1", "mealType": "lunch"})).unwrap()],
            )
            .unwrap();

        let registry = IndexRegistry::new(store);
        registry.build_index("logs", &["userId"]).await.unwrap();
        let set = registry.build_index("logs", &["mealType"]).await.unwrap();
        assert!(set.has_field("userId"));
        assert!(set.has_field("mealType"));

        assert!(registry.invalidate("logs"));
        assert!(!registry.invalidate("logs"));
        assert!(registry.cached("logs").is_none());
    }

    #[tokio::test]
    async fn test_dropping_registry_unsubscribes() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::new(dir.path())).await.unwrap();
        let registry = IndexRegistry::new(store.clone());
        assert!(registry.watch());
        assert!(!registry.watch());
        assert_eq!(store.inner.observers.len(), 1);

        drop(registry);
        assert_eq!(store.inner.observers.len(), 0);
    }

    #[tokio::test]
    async fn test_unbounded_limit_reports_no_more() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::new(dir.path())).await.unwrap();
        store
            .write(
                "w",
                vec![
                    record_from_value(json!({"id": "1", "date": "2024-01-01"})).unwrap(),
                    record_from_value(json!({"id": "2", "date": "2024-01-02"})).unwrap(),
                ],
            )
            .unwrap();
        let registry = IndexRegistry::new(store);

        let page = registry
            .query_by_filters("w", &[], Pagination::new(usize::MAX, 1), None)
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert!(!page.has_more);

        let page = registry
            .query_by_filters("w", &[], Pagination::new(1, usize::MAX), None)
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert!(!page.has_more);
    }
}
