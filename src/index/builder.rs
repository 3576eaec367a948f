use crate::core::record::index_key;
use crate::core::{Record, Snapshot, parse_timestamp};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// Value -> ascending record positions for one field.
pub type FieldIndex = HashMap<String, Vec<usize>>;

/// Secondary indexes over one immutable collection snapshot.
///
/// Built in a single scan and never patched: when the collection changes,
/// the set is dropped and rebuilt. Positions always refer to the snapshot
/// the set holds, so even a set that outlives a write resolves to real
/// (if outdated) records.
#[derive(Debug)]
pub struct IndexSet {
    snapshot: Arc<Snapshot>,
    fields: HashMap<String, FieldIndex>,
    /// Epoch millis per position, from the first parseable date field.
    timestamps: Vec<Option<i64>>,
    built_at: Instant,
}

impl IndexSet {
    pub fn build<S: AsRef<str>>(snapshot: Arc<Snapshot>, fields: &[S], date_fields: &[String]) -> Self {
        let mut indexes: HashMap<String, FieldIndex> = fields
            .iter()
            .map(|f| (f.as_ref().to_string(), FieldIndex::new()))
            .collect();
        let mut timestamps = Vec::with_capacity(snapshot.len());

        for (position, record) in snapshot.iter().enumerate() {
            for (field, index) in indexes.iter_mut() {
                match record.get(field) {
                    None => {}
                    Some(Value::Array(items)) => {
                        for item in items {
                            push_position(index, index_key(item), position);
                        }
                    }
                    Some(value) => push_position(index, index_key(value), position),
                }
            }
            timestamps.push(record_timestamp(record, date_fields));
        }

        Self {
            snapshot,
            fields: indexes,
            timestamps,
            built_at: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }

    pub fn built_at(&self) -> Instant {
        self.built_at
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn fields(&self) -> BTreeSet<String> {
        self.fields.keys().cloned().collect()
    }

    /// True when this set was built from exactly `snapshot`.
    pub fn is_built_from(&self, snapshot: &Arc<Snapshot>) -> bool {
        Arc::ptr_eq(&self.snapshot, snapshot)
    }

    /// Positions whose `field` equals (or, for arrays, contains) `value`.
    /// `None` when `field` is not indexed in this set.
    pub fn positions(&self, field: &str, value: &Value) -> Option<&[usize]> {
        let index = self.fields.get(field)?;
        Some(
            index
                .get(&index_key(value))
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        )
    }

    /// Positions with a timestamp inside `[from, to]`; open bounds are unbounded.
    pub fn positions_in_range(&self, from: Option<i64>, to: Option<i64>) -> Vec<usize> {
        let from = from.unwrap_or(i64::MIN);
        let to = to.unwrap_or(i64::MAX);
        self.timestamps
            .iter()
            .enumerate()
            .filter_map(|(position, ts)| match ts {
                Some(ts) if *ts >= from && *ts <= to => Some(position),
                _ => None,
            })
            .collect()
    }

    pub fn timestamp(&self, position: usize) -> Option<i64> {
        self.timestamps.get(position).copied().flatten()
    }

    pub fn record(&self, position: usize) -> Option<&Record> {
        self.snapshot.get(position)
    }
}

fn push_position(index: &mut FieldIndex, key: String, position: usize) {
    let positions = index.entry(key).or_default();
    // An array holding the same value twice still maps to one position.
    if positions.last() != Some(&position) {
        positions.push(position);
    }
}

pub(crate) fn record_timestamp(record: &Record, date_fields: &[String]) -> Option<i64> {
    date_fields
        .iter()
        .find_map(|field| record.get(field).and_then(parse_timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record_from_value;
    use serde_json::json;

    fn snapshot() -> Arc<Snapshot> {
        Arc::new(
            vec![
                json!({"id": "1", "userId": "u1", "tags": ["run", "am"], "date": "2024-01-02"}),
                json!({"id": "2", "userId": "u2", "tags": ["swim"], "date": "2024-01-05"}),
                json!({"id": "3", "userId": "u1", "tags": ["run", "run"]}),
                json!({"id": "4", "userId": null, "date": "garbage"}),
            ]
            .into_iter()
            .map(|v| record_from_value(v).unwrap())
            .collect(),
        )
    }

    fn dates() -> Vec<String> {
        vec!["date".to_string()]
    }

    #[test]
    fn test_scalar_field() {
        let set = IndexSet::build(snapshot(), &["userId"], &dates());
        assert_eq!(set.positions("userId", &json!("u1")), Some(&[0, 2][..]));
        assert_eq!(set.positions("userId", &json!(null)), Some(&[3][..]));
        assert_eq!(set.positions("userId", &json!("nobody")), Some(&[][..]));
        assert_eq!(set.positions("exerciseType", &json!("x")), None);
    }

    #[test]
    fn test_array_field_contributes_each_element() {
        let set = IndexSet::build(snapshot(), &["tags"], &dates());
        assert_eq!(set.positions("tags", &json!("run")), Some(&[0, 2][..]));
        assert_eq!(set.positions("tags", &json!("swim")), Some(&[1][..]));
    }

    #[test]
    fn test_timestamps_skip_missing_and_unparseable() {
        let set = IndexSet::build(snapshot(), &[] as &[&str], &dates());
        assert!(set.timestamp(0).is_some());
        assert!(set.timestamp(2).is_none());
        assert!(set.timestamp(3).is_none());

        let jan3 = parse_timestamp(&json!("2024-01-03"));
        assert_eq!(set.positions_in_range(jan3, None), vec![1]);
        assert_eq!(set.positions_in_range(None, jan3), vec![0]);
        assert_eq!(set.positions_in_range(None, None), vec![0, 1]);
    }

    #[test]
    fn test_numbers_and_strings_are_distinct_keys() {
        let snap = Arc::new(vec![
            record_from_value(json!({"n": 1})).unwrap(),
            record_from_value(json!({"n": "1"})).unwrap(),
        ]);
        let set = IndexSet::build(snap, &["n"], &dates());
        assert_eq!(set.positions("n", &json!(1)), Some(&[0][..]));
        assert_eq!(set.positions("n", &json!("1")), Some(&[1][..]));
    }

    #[test]
    fn test_integral_float_matches_integer_lookup() {
        let snap = Arc::new(vec![
            record_from_value(json!({"n": 1.0})).unwrap(),
            record_from_value(json!({"n": 2})).unwrap(),
            record_from_value(json!({"n": 1.5})).unwrap(),
        ]);
        let set = IndexSet::build(snap, &["n"], &dates());
        assert_eq!(set.positions("n", &json!(1)), Some(&[0][..]));
        assert_eq!(set.positions("n", &json!(2.0)), Some(&[1][..]));
        assert_eq!(set.positions("n", &json!(1.5)), Some(&[2][..]));
    }
}
