//! Storage engine module providing MVCC (Multi-Version Concurrency Control) semantics.
//!
//! The engine keeps every revision of every key in a sled-backed revision log and an
//! in-memory tree index that maps logical keys to their revision history:
//!
//! - The backend is ordered by revision, which makes recovery a sequential scan and
//!   compaction a prefix delete.
//! - The index is ordered by key, which makes point and range reads at any revision cheap.
//!
//! The MVCC model ensures:
//! - Every committed write transaction creates exactly one new main revision
//! - Point-in-time reads at any revision that has not been compacted
//! - Atomic multi-key writes sharing one main revision with distinct sub revisions
//! - Background compaction that never changes reads above the compaction revision

pub mod backend;
pub mod compaction;
pub mod index;
pub mod key_index;
pub mod mvcc;
pub mod restore;
pub mod revision;

pub use backend::{
    Backend, BackendConfig, BackendError, BackendResult, WriteBatch, KEY_BUCKET, META_BUCKET,
};
pub use compaction::{CompactionMode, Compactor};
pub use index::{IndexEntry, TreeIndex};
pub use key_index::{Generation, KeyIndex};
pub use mvcc::{
    Event, EventType, KeyValue, RangeOptions, RangeResult, ReadTxn, Store, StoreConfig, WriteTxn,
};
pub use revision::Revision;

use thiserror::Error;

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// The key does not resolve to a live value at the requested revision.
    #[error("Revision not found")]
    RevisionNotFound,

    #[error("Required revision {requested} has been compacted (compacted up to {compacted})")]
    Compacted { requested: i64, compacted: i64 },

    #[error("Required revision {requested} is a future revision (current {current})")]
    FutureRevision { requested: i64, current: i64 },

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("Compaction error: {0}")]
    Compaction(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Store is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
