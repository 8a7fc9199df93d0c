//! Sled-backed persistent storage backend.
//!
//! The backend is an ordered, durable byte-range store organised in buckets (one sled tree
//! per bucket). The MVCC layer only relies on:
//!
//! - point `get`/`put`/`delete` within a bucket
//! - ordered scans over `[start, end)` with a limit, used as a chunked cursor
//! - atomic per-bucket write batches, flushed on commit when `sync_on_commit` is set
//!
//! Two buckets are reserved and always present:
//! - `key`: the revision log, keyed by encoded revision
//! - `meta`: engine metadata such as the finished compaction revision

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

/// Bucket holding the revision log.
pub const KEY_BUCKET: &str = "key";

/// Bucket holding engine metadata.
pub const META_BUCKET: &str = "meta";

const SLED_DEFAULT_TREE: &[u8] = b"__sled__default";

/// Backend storage errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Sled error: {0}")]
    SledError(#[from] sled::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Configuration for the backend storage.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Path to the data directory where sled stores all files.
    pub data_dir: PathBuf,

    /// Maximum page cache size in megabytes.
    pub cache_size_mb: u64,

    /// How often sled flushes dirty pages in the background (0 disables it).
    pub flush_interval_ms: u64,

    /// Flush to disk as part of every committed write batch.
    pub sync_on_commit: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 256,
            flush_interval_ms: 1000,
            sync_on_commit: false,
        }
    }
}

/// A set of writes applied atomically per bucket.
#[derive(Default)]
pub struct WriteBatch {
    buckets: HashMap<String, sled::Batch>,
    len: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) {
        self.bucket(bucket).insert(key, value);
        self.len += 1;
    }

    pub fn delete(&mut self, bucket: &str, key: &[u8]) {
        self.bucket(bucket).remove(key);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket(&mut self, bucket: &str) -> &mut sled::Batch {
        self.buckets.entry(bucket.to_string()).or_default()
    }
}

/// The persistent storage backend using sled.
pub struct Backend {
    /// The sled database instance
    db: sled::Db,

    /// Open bucket handles by name
    buckets: RwLock<HashMap<String, sled::Tree>>,

    config: BackendConfig,
}

impl Backend {
    /// Opens (or creates) the backend described by `config`.
    ///
    /// Existing buckets are reopened and the reserved buckets are created if missing.
    pub fn new(config: BackendConfig) -> BackendResult<Arc<Self>> {
        debug!("Initializing storage backend at {:?}", config.data_dir);

        std::fs::create_dir_all(&config.data_dir)?;

        let flush_every = (config.flush_interval_ms > 0).then_some(config.flush_interval_ms);
        let db = sled::Config::new()
            .path(&config.data_dir)
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(flush_every)
            .open()
            .map_err(|e| {
                BackendError::ConfigError(format!("Failed to open sled database: {}", e))
            })?;

        let mut buckets = HashMap::new();
        for name in db.tree_names() {
            if name.as_ref() == SLED_DEFAULT_TREE {
                continue;
            }
            let name = String::from_utf8_lossy(&name).into_owned();
            let tree = db.open_tree(&name)?;
            buckets.insert(name, tree);
        }
        for name in [KEY_BUCKET, META_BUCKET] {
            if !buckets.contains_key(name) {
                buckets.insert(name.to_string(), db.open_tree(name)?);
            }
        }

        info!(
            "Storage backend initialized with {} buckets, cache_size={}MB, flush_interval={}ms, sync_on_commit={}",
            buckets.len(),
            config.cache_size_mb,
            config.flush_interval_ms,
            config.sync_on_commit
        );

        Ok(Arc::new(Self {
            db,
            buckets: RwLock::new(buckets),
            config,
        }))
    }

    /// Gets the bucket handle by name.
    fn bucket(&self, name: &str) -> BackendResult<sled::Tree> {
        self.buckets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::BucketNotFound(name.to_string()))
    }

    /// Creates a bucket. Creating an existing bucket is a no-op.
    pub fn create_bucket(&self, name: &str) -> BackendResult<()> {
        let mut buckets = self.buckets.write();
        if !buckets.contains_key(name) {
            let tree = self.db.open_tree(name)?;
            buckets.insert(name.to_string(), tree);
            debug!("Created bucket {}", name);
        }
        Ok(())
    }

    /// Deletes a bucket and all of its contents.
    pub fn delete_bucket(&self, name: &str) -> BackendResult<()> {
        let mut buckets = self.buckets.write();
        if buckets.remove(name).is_none() {
            return Err(BackendError::BucketNotFound(name.to_string()));
        }
        self.db.drop_tree(name)?;
        debug!("Deleted bucket {}", name);
        Ok(())
    }

    #[cfg(test)]
    pub fn has_bucket(&self, name: &str) -> bool {
        self.buckets.read().contains_key(name)
    }

    /// Stores a key-value pair in the specified bucket.
    pub fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> BackendResult<()> {
        self.bucket(bucket)?.insert(key, value)?;
        Ok(())
    }

    /// Retrieves a value by key from the specified bucket.
    pub fn get(&self, bucket: &str, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.bucket(bucket)?.get(key)?.map(|v| v.to_vec()))
    }

    /// Deletes a key from the specified bucket.
    #[cfg(test)]
    pub fn delete(&self, bucket: &str, key: &[u8]) -> BackendResult<()> {
        self.bucket(bucket)?.remove(key)?;
        Ok(())
    }

    /// Applies a write batch. Each bucket's writes land atomically.
    ///
    /// With `sync_on_commit` the batch is flushed to disk before returning.
    pub fn commit(&self, batch: WriteBatch) -> BackendResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let len = batch.len;
        for (name, writes) in batch.buckets {
            self.bucket(&name)?.apply_batch(writes)?;
        }

        if self.config.sync_on_commit {
            self.db.flush()?;
        }

        debug!("Committed write batch with {} operations", len);
        Ok(())
    }

    /// Scans a range of keys in the specified bucket.
    ///
    /// Returns key-value pairs with start <= key < end in key order. An empty `end`
    /// scans to the end of the bucket. If limit is 0, all matching keys are returned.
    pub fn scan(
        &self,
        bucket: &str,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> BackendResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let tree = self.bucket(bucket)?;
        let mut results = Vec::new();

        let iter = if end.is_empty() {
            tree.range(start..)
        } else if end <= start {
            return Ok(results);
        } else {
            tree.range(start..end)
        };

        for item in iter {
            let (k, v) = item?;
            results.push((k.to_vec(), v.to_vec()));

            if limit > 0 && results.len() >= limit {
                break;
            }
        }

        Ok(results)
    }

    /// Returns the approximate total size of the database in bytes.
    pub fn size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> BackendResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
