use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DATA_DIR_ENV: &str = "FLATSTORE_DATA_DIR";

/// Store configuration
///
/// The data directory is the only setting a deployment normally touches;
/// the rest are tuning knobs with defaults that match a small web backend.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory holding one document per collection
    pub data_dir: PathBuf,

    /// Quiescence window after the last write before a batched flush
    pub batch_delay: Duration,

    /// Queue length that forces a flush without waiting for the window
    pub max_queue_size: usize,

    /// Default lease wait, and lifetime of leases handed over from the queue
    pub lock_timeout: Duration,

    /// Period of the background expired-lease sweep
    pub lock_sweep_interval: Duration,

    /// Clean cached snapshots untouched for this long may be evicted
    pub cache_idle_ttl: Option<Duration>,

    /// Extension of collection documents
    pub file_extension: String,

    /// Fields tried, in order, when deriving a record's timestamp
    pub date_fields: Vec<String>,
}

impl StoreConfig {
    /// Create a configuration rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            batch_delay: Duration::from_millis(100),
            max_queue_size: 50,
            lock_timeout: Duration::from_secs(30),
            lock_sweep_interval: Duration::from_secs(5),
            cache_idle_ttl: Some(Duration::from_secs(3600)),
            file_extension: "json".to_string(),
            date_fields: vec!["date".to_string(), "createdAt".to_string()],
        }
    }

    /// Read the data directory from `FLATSTORE_DATA_DIR`, falling back to `./data`
    pub fn from_env() -> Self {
        let dir = std::env::var(DATA_DIR_ENV).unwrap_or_else(|_| "./data".to_string());
        Self::new(dir)
    }

    /// Set the quiescence window
    pub fn batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Set the queue length that triggers an immediate flush
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the default lock timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the expired-lease sweep period
    pub fn lock_sweep_interval(mut self, interval: Duration) -> Self {
        self.lock_sweep_interval = interval;
        self
    }

    /// Set (or disable with `None`) idle cache eviction
    pub fn cache_idle_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_idle_ttl = ttl;
        self
    }

    /// Set the document extension (without the dot)
    pub fn file_extension(mut self, ext: &str) -> Self {
        self.file_extension = ext.trim_start_matches('.').to_string();
        self
    }

    /// Replace the list of date-like fields
    pub fn date_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.date_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Path of the document backing `collection`
    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", collection, self.file_extension))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.data_dir.as_os_str().is_empty() {
            return Err("data_dir cannot be empty".to_string());
        }

        if self.batch_delay.is_zero() {
            return Err("batch_delay must be > 0".to_string());
        }

        if self.max_queue_size == 0 {
            return Err("max_queue_size must be > 0".to_string());
        }

        if self.lock_timeout.is_zero() {
            return Err("lock_timeout must be > 0".to_string());
        }

        if self.lock_sweep_interval.is_zero() {
            return Err("lock_sweep_interval must be > 0".to_string());
        }

        if self.file_extension.is_empty() {
            return Err("file_extension cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("./data")
    }
}
