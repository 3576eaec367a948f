use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Raw counters for one collection.
#[derive(Debug, Clone, Default)]
pub(crate) struct CollectionCounters {
    pub loads: u64,
    pub load_time: Duration,
    pub hits: u64,
    pub misses: u64,
    pub flushes: u64,
    pub flush_time: Duration,
    pub batched_writes: u64,
    pub flush_failures: u64,
}

impl CollectionCounters {
    pub fn record_flush(&mut self, elapsed: Duration, batch_size: usize) {
        self.flushes += 1;
        self.flush_time += elapsed;
        self.batched_writes += batch_size as u64;
    }

    pub fn stats(&self) -> CollectionMetrics {
        let lookups = self.hits + self.misses;
        CollectionMetrics {
            loads: self.loads,
            avg_load_ms: average_ms(self.load_time, self.loads),
            hits: self.hits,
            misses: self.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
            flushes: self.flushes,
            avg_flush_ms: average_ms(self.flush_time, self.flushes),
            avg_batch_size: if self.flushes == 0 {
                0.0
            } else {
                self.batched_writes as f64 / self.flushes as f64
            },
            flush_failures: self.flush_failures,
        }
    }
}

fn average_ms(total: Duration, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total.as_secs_f64() * 1000.0 / count as f64
    }
}

/// Per-collection cache and flush statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionMetrics {
    /// Number of disk loads (cold reads and reloads after invalidation).
    pub loads: u64,
    pub avg_load_ms: f64,
    /// Reads served from the cache.
    pub hits: u64,
    /// Reads that had to go to disk.
    pub misses: u64,
    pub hit_rate: f64,
    /// Completed flushes.
    pub flushes: u64,
    pub avg_flush_ms: f64,
    /// Average number of coalesced writes per flush.
    pub avg_batch_size: f64,
    pub flush_failures: u64,
}

/// Point-in-time copy of the store's metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreMetrics {
    pub collections: BTreeMap<String, CollectionMetrics>,
}

impl StoreMetrics {
    pub fn collection(&self, name: &str) -> Option<&CollectionMetrics> {
        self.collections.get(name)
    }
}
