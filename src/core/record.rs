use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::cmp::Ordering;

/// One schema-less entity. The shape belongs to the calling domain module;
/// the engine only ever looks at `id` and at fields it is asked to index.
pub type Record = serde_json::Map<String, Value>;

/// Complete ordered contents of one collection.
pub type Snapshot = Vec<Record>;

pub const ID_FIELD: &str = "id";

/// Returns the record's `id` rendered as a string, if present.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get(ID_FIELD)? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Builds a record from a JSON object literal; anything else is rejected.
pub fn record_from_value(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Canonical hashable key for a JSON value.
///
/// Numbers that compare equal share a key, so `1`, `1.0` and `1e0` all map
/// to `1`. Every other value keys on its JSON text.
pub(crate) fn index_key(value: &Value) -> String {
    match value {
        Value::Number(n) => number_key(n),
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    }
}

fn number_key(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
            (f as i64).to_string()
        }
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// Interprets a value as a point in time, in epoch milliseconds.
///
/// Accepts RFC 3339 strings, naive `YYYY-MM-DDTHH:MM:SS[.fff]` strings,
/// plain `YYYY-MM-DD` dates (midnight UTC) and integral epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => parse_date_str(s),
        _ => None,
    }
}

fn parse_date_str(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis());
    }
    None
}

/// Orders two field values: numbers numerically, booleans false < true,
/// everything else by its string form.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => value_text(a).cmp(&value_text(b)),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_accepts_strings_and_numbers() {
        let a = record_from_value(json!({"id": "u-1"})).unwrap();
        let b = record_from_value(json!({"id": 42})).unwrap();
        let c = record_from_value(json!({"name": "x"})).unwrap();
        assert_eq!(record_id(&a).as_deref(), Some("u-1"));
        assert_eq!(record_id(&b).as_deref(), Some("42"));
        assert_eq!(record_id(&c), None);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let day = parse_timestamp(&json!("2024-03-01")).unwrap();
        let rfc = parse_timestamp(&json!("2024-03-01T00:00:00Z")).unwrap();
        let naive = parse_timestamp(&json!("2024-03-01T00:00:00.000")).unwrap();
        assert_eq!(day, rfc);
        assert_eq!(day, naive);
        assert_eq!(parse_timestamp(&json!(1_000)), Some(1_000));
        assert_eq!(parse_timestamp(&json!("not a date")), None);
        assert_eq!(parse_timestamp(&json!(true)), None);
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!(false), &json!(true)), Ordering::Less);
    }

    #[test]
    fn test_index_key_unifies_equal_numbers() {
        assert_eq!(index_key(&json!(1)), index_key(&json!(1.0)));
        assert_eq!(index_key(&json!(-3)), index_key(&json!(-3.0)));
        assert_eq!(index_key(&json!(0)), index_key(&json!(-0.0)));
        assert_ne!(index_key(&json!(1)), index_key(&json!(1.5)));
        assert_ne!(index_key(&json!(1)), index_key(&json!("1")));
        assert_eq!(index_key(&json!(u64::MAX)), u64::MAX.to_string());
    }
}
