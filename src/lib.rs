//! # revkv: an embedded multi-version key-value engine
//!
//! revkv keeps every revision of every key in a persistent, revision-ordered log and
//! serves reads from an in-memory index ordered by key. It provides:
//!
//! - **MVCC semantics**: point and range reads at any retained historical revision
//! - **Atomic transactions**: multi-key writes sharing one main revision
//! - **Tombstones**: deletions are recorded as revisions, keys can be recreated
//! - **Compaction**: background reclamation of revisions no reader can observe
//! - **Fast recovery**: the index is rebuilt from the revision log on open
//!
//! # Usage
//!
//! ```bash
//! revkv --data-dir ./data put greeting hello
//! revkv --data-dir ./data get greeting
//! revkv --data-dir ./data run --compaction-mode revision --compaction-retention 1000
//! ```

pub mod storage;

// Re-export main types at crate root for convenience
pub use storage::{
    Backend, BackendConfig, CompactionMode, Compactor, Event, EventType, KeyValue, RangeOptions,
    RangeResult, StorageError, StorageResult, Store, StoreConfig,
};
