//! Lazy secondary indexes: staleness contract, filters, sort and pagination

use flatstore::index::NullOrdering;
use flatstore::{
    DbError, IndexRegistry, Pagination, Predicate, Query, Record, SortSpec, Store, StoreConfig,
    record_from_value,
};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

fn workout(id: &str, user: &str, kind: &str, date: &str, calories: u64) -> Record {
    record_from_value(json!({
        "id": id,
        "userId": user,
        "exerciseType": kind,
        "date": date,
        "calories": calories,
    }))
    .unwrap()
}

fn ids(records: &[Record]) -> Vec<&str> {
    records.iter().map(|r| r["id"].as_str().unwrap()).collect()
}

async fn seeded() -> (TempDir, Store, IndexRegistry) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreConfig::new(dir.path()).batch_delay(Duration::from_secs(60)))
        .await
        .unwrap();
    store
        .write(
            "workouts",
            vec![
                workout("w1", "u1", "run", "2024-01-01T07:00:00Z", 300),
                workout("w2", "u2", "swim", "2024-01-02T07:00:00Z", 450),
                workout("w3", "u1", "bike", "2024-01-03T07:00:00Z", 600),
                workout("w4", "u1", "run", "2024-01-04T07:00:00Z", 250),
                workout("w5", "u2", "run", "2024-01-05T07:00:00Z", 500),
            ],
        )
        .unwrap();
    let registry = IndexRegistry::new(store.clone());
    (dir, store, registry)
}

#[tokio::test]
async fn test_query_builds_lazily() {
    let (_dir, _store, registry) = seeded().await;
    assert!(registry.cached("workouts").is_none());

    let found = registry
        .query_by_field("workouts", "userId", &json!("u1"))
        .await
        .unwrap();
    assert_eq!(ids(&found), vec!["w1", "w3", "w4"]);
    assert!(registry.cached("workouts").unwrap().has_field("userId"));
}

#[tokio::test]
async fn test_unwatched_index_stays_stale_until_invalidated() {
    let (_dir, store, registry) = seeded().await;
    registry.build_index("workouts", &["userId"]).await.unwrap();

    let mut next = store.read("workouts").await.unwrap();
    next.retain(|w| w["id"] != json!("w1"));
    next.push(workout("w6", "u1", "run", "2024-01-06T07:00:00Z", 100));
    store.write("workouts", next).unwrap();

    // Without invalidation the index keeps answering from the snapshot it
    // was built from: stale but consistent records, never wrong positions.
    let stale = registry
        .query_by_field("workouts", "userId", &json!("u1"))
        .await
        .unwrap();
    assert_eq!(ids(&stale), vec!["w1", "w3", "w4"]);

    assert!(registry.invalidate("workouts"));
    let fresh = registry
        .query_by_field("workouts", "userId", &json!("u1"))
        .await
        .unwrap();
    assert_eq!(ids(&fresh), vec!["w3", "w4", "w6"]);
}

#[tokio::test]
async fn test_watched_index_follows_writes() {
    let (_dir, store, registry) = seeded().await;
    assert!(registry.watch());
    registry.build_index("workouts", &["userId"]).await.unwrap();

    store
        .write("workouts", vec![workout("w9", "u1", "row", "2024-02-01", 50)])
        .unwrap();
    assert!(registry.cached("workouts").is_none());

    let found = registry
        .query_by_field("workouts", "userId", &json!("u1"))
        .await
        .unwrap();
    assert_eq!(ids(&found), vec!["w9"]);

    assert!(registry.unwatch());
    store.write("workouts", Vec::new()).unwrap();
    assert!(registry.cached("workouts").is_some());
}

#[tokio::test]
async fn test_filters_intersect_and_default_to_all() {
    let (_dir, _store, registry) = seeded().await;

    let page = registry
        .query_by_filters(
            "workouts",
            &[Predicate::eq("userId", "u1"), Predicate::eq("exerciseType", "run")],
            Pagination::default(),
            None,
        )
        .await
        .unwrap();
    // Default sort: newest first.
    assert_eq!(ids(&page.items), vec!["w4", "w1"]);
    assert_eq!(page.total, 2);
    assert!(!page.has_more);

    let all = registry
        .query_by_filters("workouts", &[], Pagination::default(), None)
        .await
        .unwrap();
    assert_eq!(all.total, 5);
    assert_eq!(ids(&all.items), vec!["w5", "w4", "w3", "w2", "w1"]);

    let none = registry
        .query_by_filters(
            "workouts",
            &[Predicate::eq("userId", "u1"), Predicate::eq("exerciseType", "swim")],
            Pagination::default(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(none.total, 0);
    assert!(none.items.is_empty());
}

#[tokio::test]
async fn test_date_range_is_inclusive() {
    let (_dir, _store, registry) = seeded().await;

    let found = registry
        .query_by_date_range(
            "workouts",
            Some("2024-01-02T07:00:00Z"),
            Some("2024-01-04T07:00:00Z"),
        )
        .await
        .unwrap();
    assert_eq!(ids(&found), vec!["w2", "w3", "w4"]);

    let open_start = registry
        .query_by_date_range("workouts", None, Some("2024-01-02"))
        .await
        .unwrap();
    assert_eq!(ids(&open_start), vec!["w1"]);

    let err = registry
        .query_by_date_range("workouts", Some("last tuesday"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ValidationFailure(_)));
}

#[tokio::test]
async fn test_sort_and_paginate_after_filtering() {
    let (_dir, _store, registry) = seeded().await;

    let query = Query::new()
        .date_range(Some("2024-01-01"), None)
        .sort(SortSpec::asc("calories"))
        .limit(2)
        .offset(1);
    let page = registry.query("workouts", &query).await.unwrap();
    assert_eq!(ids(&page.items), vec!["w1", "w2"]);
    assert_eq!(page.total, 5);
    assert_eq!((page.limit, page.offset), (2, 1));
    assert!(page.has_more);

    let last = registry
        .query("workouts", &query.clone().offset(3))
        .await
        .unwrap();
    assert_eq!(ids(&last.items), vec!["w5", "w3"]);
    assert!(!last.has_more);
}

#[tokio::test]
async fn test_array_fields_and_missing_sort_values() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreConfig::new(dir.path())).await.unwrap();
    store
        .write(
            "goals",
            vec![
                record_from_value(json!({"id": "g1", "tags": ["health", "run"], "priority": 2})).unwrap(),
                record_from_value(json!({"id": "g2", "tags": ["finance"]})).unwrap(),
                record_from_value(json!({"id": "g3", "tags": ["run"], "priority": 1})).unwrap(),
            ],
        )
        .unwrap();
    let registry = IndexRegistry::new(store);

    let positions = registry
        .positions_by_field("goals", "tags", &json!("run"))
        .await
        .unwrap();
    assert_eq!(positions, vec![0, 2]);

    let asc = SortSpec::asc("priority");
    let page = registry
        .query_by_filters("goals", &[], Pagination::default(), Some(&asc))
        .await
        .unwrap();
    assert_eq!(ids(&page.items), vec!["g3", "g1", "g2"]);

    let nulls_first = SortSpec::asc("priority").with_null_ordering(NullOrdering::NullsFirst);
    let page = registry
        .query_by_filters("goals", &[], Pagination::default(), Some(&nulls_first))
        .await
        .unwrap();
    assert_eq!(ids(&page.items), vec!["g2", "g3", "g1"]);
}
