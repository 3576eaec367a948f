// ============================================================================
// src/index/sort.rs - Result ordering for filtered queries
// ============================================================================
//
// Sorting happens after filtering and before pagination. Date-like fields
// compare chronologically, numbers numerically, everything else by text.
// The sort is stable, so ties keep snapshot order.
//
// ============================================================================

use crate::core::{Record, compare_values, parse_timestamp};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// Strategy for records missing the sort field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullOrdering {
    NullsFirst,
    #[default]
    NullsLast,
}

/// Sort specification: one field, one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
    pub null_ordering: NullOrdering,
}

impl SortSpec {
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
            null_ordering: NullOrdering::default(),
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, SortOrder::Asc)
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, SortOrder::Desc)
    }

    pub fn with_null_ordering(mut self, null_ordering: NullOrdering) -> Self {
        self.null_ordering = null_ordering;
        self
    }
}

impl Default for SortSpec {
    /// Newest first by `date`.
    fn default() -> Self {
        Self::desc("date")
    }
}

/// Compares records on one field according to a `SortSpec`.
pub struct RecordComparator<'a> {
    spec: &'a SortSpec,
    chronological: bool,
}

impl<'a> RecordComparator<'a> {
    /// `date_fields` names the fields compared as points in time.
    pub fn new(spec: &'a SortSpec, date_fields: &[String]) -> Self {
        let chronological = date_fields.iter().any(|f| *f == spec.field);
        Self { spec, chronological }
    }

    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let a = present(a.get(&self.spec.field));
        let b = present(b.get(&self.spec.field));

        match (a, b) {
            (None, None) => Ordering::Equal,
            // Missing values ignore the direction.
            (None, Some(_)) => match self.spec.null_ordering {
                NullOrdering::NullsFirst => Ordering::Less,
                NullOrdering::NullsLast => Ordering::Greater,
            },
            (Some(_), None) => match self.spec.null_ordering {
                NullOrdering::NullsFirst => Ordering::Greater,
                NullOrdering::NullsLast => Ordering::Less,
            },
            (Some(a), Some(b)) => {
                let ordering = self.compare_present(a, b);
                match self.spec.order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            }
        }
    }

    fn compare_present(&self, a: &Value, b: &Value) -> Ordering {
        if self.chronological {
            match (parse_timestamp(a), parse_timestamp(b)) {
                (Some(x), Some(y)) => return x.cmp(&y),
                // Unparseable dates go after parseable ones.
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (None, None) => {}
            }
        }
        compare_values(a, b)
    }

    /// Stable in-place sort.
    pub fn sort(&self, records: &mut [&Record]) {
        records.sort_by(|a, b| self.compare(a, b));
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}
