//! Multi-Version Concurrency Control (MVCC) store.
//!
//! This is the core of the storage engine, implementing etcd's revision-based versioning.
//! Every committed write transaction advances the store revision by one, enabling:
//!
//! - Point-in-time reads at any revision above the compaction boundary
//! - Atomic multi-key writes sharing one main revision
//! - Non-blocking concurrent reads
//!
//! The MVCC store maintains:
//! 1. The revision log in the backend key bucket, keyed by encoded revision
//! 2. An in-memory tree index mapping keys to their revision history
//! 3. The current and compacted revision counters
//!
//! Lock order: write transaction lock, then revision lock. Compaction takes the
//! compaction lock, then per-key index locks, then the revision lock.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::storage::index::in_range;
use crate::storage::restore::{self, FINISHED_COMPACT_KEY, SCHEDULED_COMPACT_KEY};
use crate::storage::revision::is_tombstone;
use crate::storage::{
    Backend, Revision, StorageError, StorageResult, TreeIndex, WriteBatch, KEY_BUCKET,
    META_BUCKET,
};

/// A key-value pair with MVCC metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    /// The actual key
    pub key: Vec<u8>,

    /// The revision when this key was created
    pub create_revision: i64,

    /// The revision when this key was last modified
    pub mod_revision: i64,

    /// Version is the number of times this key has been modified since creation
    pub version: i64,

    /// The actual value
    pub value: Vec<u8>,
}

impl KeyValue {
    /// Serializes the KeyValue, key included, for the revision log.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.key.len() + self.value.len());

        buf.extend_from_slice(&self.create_revision.to_le_bytes());
        buf.extend_from_slice(&self.mod_revision.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());

        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);

        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.value);

        buf
    }

    /// Deserializes a KeyValue from revision log bytes.
    pub fn decode(data: &[u8]) -> StorageResult<Self> {
        let mut reader = EnvelopeReader { data, offset: 0 };

        let create_revision = reader.i64()?;
        let mod_revision = reader.i64()?;
        let version = reader.i64()?;
        let key = reader.bytes()?;
        let value = reader.bytes()?;

        if reader.offset != data.len() {
            return Err(StorageError::Corrupt(format!(
                "{} trailing bytes in key-value envelope",
                data.len() - reader.offset
            )));
        }

        Ok(KeyValue {
            key,
            create_revision,
            mod_revision,
            version,
            value,
        })
    }
}

struct EnvelopeReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl EnvelopeReader<'_> {
    fn take(&mut self, len: usize) -> StorageResult<&[u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                StorageError::Corrupt(format!(
                    "key-value envelope truncated at byte {} of {}",
                    self.offset,
                    self.data.len()
                ))
            })?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn i64(&mut self) -> StorageResult<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(buf))
    }

    fn bytes(&mut self) -> StorageResult<Vec<u8>> {
        let mut len = [0u8; 4];
        len.copy_from_slice(self.take(4)?);
        Ok(self.take(u32::from_le_bytes(len) as usize)?.to_vec())
    }
}

/// Options for a range read.
#[derive(Clone, Copy, Debug, Default)]
pub struct RangeOptions {
    /// Maximum number of key-values returned; 0 or less means unbounded
    pub limit: i64,

    /// Revision to read at; 0 or less reads at the transaction's revision
    pub rev: i64,

    /// Only count the keys in range
    pub count_only: bool,
}

/// Result of a range query.
#[derive(Clone, Debug)]
pub struct RangeResult {
    /// The key-value pairs
    pub kvs: Vec<KeyValue>,

    /// The store revision the read was served from
    pub rev: i64,

    /// Number of live keys in the range (before limit)
    pub count: usize,

    /// More indicates the limit cut off some keys
    pub more: bool,
}

/// Kind of change recorded in the revision log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single change to a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,

    /// For deletes only `key` and `mod_revision` are set
    pub kv: KeyValue,
}

/// Tuning for a store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Revision log entries read per chunk during restore; also the size of the restore
    /// channel and key cache.
    pub restore_chunk_keys: usize,

    /// Revision log entries deleted per backend batch during compaction.
    pub compaction_batch_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            restore_chunk_keys: 10_000,
            compaction_batch_limit: 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct RevisionState {
    /// Revision of the last committed transaction
    current: i64,

    /// Main revision of the last finished compaction, -1 if none
    compact_main: i64,
}

/// The MVCC Store - the core storage engine.
pub struct Store {
    /// The underlying persistent storage backend
    backend: Arc<Backend>,

    /// In-memory index of keys to revisions
    index: Arc<TreeIndex>,

    /// Current and compacted revisions
    revs: RwLock<RevisionState>,

    /// Serializes write transactions
    write_lock: Mutex<()>,

    /// Serializes compaction sweeps
    compact_lock: Mutex<()>,

    closed: AtomicBool,

    config: StoreConfig,
}

impl Store {
    /// Opens the store, rebuilding the key index from the backend.
    ///
    /// A fresh store sits at revision 1, an empty initial revision, so the first committed
    /// write transaction is revision 2.
    pub fn open(backend: Arc<Backend>, config: StoreConfig) -> StorageResult<Arc<Self>> {
        Self::open_with_cancel(backend, config, &crossbeam_channel::never())
    }

    /// Opens the store; the index rebuild aborts when `cancel` receives a message or
    /// is disconnected.
    pub fn open_with_cancel(
        backend: Arc<Backend>,
        config: StoreConfig,
        cancel: &Receiver<()>,
    ) -> StorageResult<Arc<Self>> {
        info!("Initializing MVCC store");
        let started = Instant::now();

        let index = Arc::new(TreeIndex::new());
        let outcome = restore::restore(&backend, &index, config.restore_chunk_keys, cancel)?;

        let store = Arc::new(Self {
            backend,
            index,
            revs: RwLock::new(RevisionState {
                current: outcome.current_rev,
                compact_main: outcome.compact_main_rev,
            }),
            write_lock: Mutex::new(()),
            compact_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            config,
        });

        info!(
            "MVCC store initialized with revision={} compact_revision={} in {:?}",
            outcome.current_rev,
            outcome.compact_main_rev,
            started.elapsed()
        );

        if let Some(rev) = outcome.pending_compaction {
            info!("Resuming unfinished compaction at revision {}", rev);
            store.compact(rev)?;
        }

        Ok(store)
    }

    /// Gets the current revision.
    pub fn current_revision(&self) -> i64 {
        self.revs.read().current
    }

    /// Gets the main revision of the last finished compaction (-1 if none).
    pub fn compact_revision(&self) -> i64 {
        self.revs.read().compact_main
    }

    /// Returns the number of keys with history in the index.
    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    /// Returns the approximate on-disk size of the backend.
    pub fn db_size(&self) -> u64 {
        self.backend.size()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Starts a read transaction at the current revision.
    pub fn read(&self) -> StorageResult<ReadTxn<'_>> {
        self.ensure_open()?;
        let revs = *self.revs.read();
        Ok(ReadTxn {
            store: self,
            rev: revs.current,
            compact_main: revs.compact_main,
        })
    }

    /// Starts a write transaction. Write transactions are serialized.
    pub fn write(&self) -> StorageResult<WriteTxn<'_>> {
        self.ensure_open()?;
        let guard = self.write_lock.lock();
        // Close may have won the race for the lock.
        self.ensure_open()?;

        let revs = *self.revs.read();
        Ok(WriteTxn {
            store: self,
            _guard: guard,
            begin_rev: revs.current,
            compact_main: revs.compact_main,
            changes: Vec::new(),
            pending: BTreeMap::new(),
        })
    }

    /// Puts a single key in its own transaction, returning the new revision.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<i64> {
        let mut txn = self.write()?;
        let rev = txn.put(key, value)?;
        txn.commit()?;
        Ok(rev)
    }

    /// Deletes a range in its own transaction, returning (deleted, revision).
    pub fn delete_range(&self, key: &[u8], end: Option<&[u8]>) -> StorageResult<(i64, i64)> {
        let mut txn = self.write()?;
        let deleted = txn.delete_range(key, end)?;
        txn.commit()?;
        Ok(deleted)
    }

    /// Reads a range in its own read transaction.
    pub fn range(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        opts: RangeOptions,
    ) -> StorageResult<RangeResult> {
        self.read()?.range(key, end, opts)
    }

    fn range_at(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        opts: RangeOptions,
        current: i64,
        compact_main: i64,
    ) -> StorageResult<RangeResult> {
        let rev = if opts.rev <= 0 { current } else { opts.rev };
        if rev > current {
            return Err(StorageError::FutureRevision {
                requested: rev,
                current,
            });
        }
        // The newest revision at or below the compaction point survives, so reads at
        // exactly `compact_main` still resolve.
        if rev < compact_main {
            return Err(StorageError::Compacted {
                requested: rev,
                compacted: compact_main,
            });
        }

        let entries = self.index.range(key, end, rev);
        let count = entries.len();
        if opts.count_only {
            return Ok(RangeResult {
                kvs: Vec::new(),
                rev: current,
                count,
                more: false,
            });
        }

        let limit = if opts.limit > 0 {
            (opts.limit as usize).min(count)
        } else {
            count
        };

        let mut kvs = Vec::with_capacity(limit);
        for entry in entries.into_iter().take(limit) {
            match self.backend.get(KEY_BUCKET, &entry.modified.to_bytes())? {
                Some(data) => kvs.push(KeyValue::decode(&data)?),
                None => warn!(
                    "Revision {:?} of key {:?} missing from backend (compacted concurrently?)",
                    entry.modified,
                    String::from_utf8_lossy(&entry.key)
                ),
            }
        }

        Ok(RangeResult {
            more: count > limit,
            kvs,
            rev: current,
            count,
        })
    }

    /// Returns every change with main revision `>= from_rev`, oldest first.
    pub fn events(&self, from_rev: i64) -> StorageResult<Vec<Event>> {
        let txn = self.read()?;
        if from_rev < txn.first_rev() {
            return Err(StorageError::Compacted {
                requested: from_rev,
                compacted: txn.compact_main,
            });
        }
        if from_rev > txn.rev {
            return Ok(Vec::new());
        }

        let start = Revision::new(from_rev, 0).to_bytes();
        let end = Revision::new(txn.rev + 1, 0).to_bytes();
        let entries = self.backend.scan(KEY_BUCKET, &start, &end, 0)?;

        entries
            .into_iter()
            .map(|(raw_key, data)| {
                let event_type = if is_tombstone(&raw_key) {
                    EventType::Delete
                } else {
                    EventType::Put
                };
                Ok(Event {
                    event_type,
                    kv: KeyValue::decode(&data)?,
                })
            })
            .collect()
    }

    /// Compacts every revision at or below `rev` that no read above `rev` can observe.
    ///
    /// The sweep runs on a background thread. The returned receiver yields the outcome
    /// once and then disconnects. Compacting at or below the last compaction is a no-op.
    pub fn compact(self: &Arc<Self>, rev: i64) -> StorageResult<Receiver<StorageResult<()>>> {
        self.ensure_open()?;
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let revs = *self.revs.read();
        if rev > revs.current {
            return Err(StorageError::FutureRevision {
                requested: rev,
                current: revs.current,
            });
        }
        if rev <= revs.compact_main {
            debug!(
                "Compact requested at revision {} (already compacted to {})",
                rev, revs.compact_main
            );
            // Bounded(1) with no other sender: cannot fail.
            let _ = done_tx.send(Ok(()));
            return Ok(done_rx);
        }

        let store = Arc::clone(self);
        thread::Builder::new()
            .name("mvcc-compact".to_string())
            .spawn(move || {
                let result = store.run_compaction(rev);
                if let Err(e) = &result {
                    warn!("Compaction at revision {} failed: {}", rev, e);
                }
                // Release the store before reporting so a waiter can reopen the data dir.
                drop(store);
                let _ = done_tx.send(result);
            })?;

        Ok(done_rx)
    }

    fn run_compaction(&self, rev: i64) -> StorageResult<()> {
        let _guard = self.compact_lock.lock();
        if rev <= self.compact_revision() {
            return Ok(());
        }

        // Written under the compaction lock, so the marker only moves forward.
        self.backend
            .put(META_BUCKET, SCHEDULED_COMPACT_KEY, &rev.to_be_bytes())?;

        let started = Instant::now();
        let batch_limit = self.config.compaction_batch_limit.max(1);

        let keep = self.index.compact(rev, batch_limit);
        let deleted = self.sweep_revision_log(rev, &keep, batch_limit)?;

        let mut batch = WriteBatch::new();
        batch.put(META_BUCKET, FINISHED_COMPACT_KEY, &rev.to_be_bytes());
        self.backend.commit(batch)?;
        self.backend.flush()?;

        self.revs.write().compact_main = rev;

        info!(
            "Compacted MVCC store to revision {} ({} log entries removed, {} kept) in {:?}",
            rev,
            deleted,
            keep.len(),
            started.elapsed()
        );
        Ok(())
    }

    /// Deletes revision log entries at or below `rev` that are not in `keep`.
    fn sweep_revision_log(
        &self,
        rev: i64,
        keep: &HashSet<Revision>,
        batch_limit: usize,
    ) -> StorageResult<usize> {
        let end = Revision::new(rev + 1, 0).to_bytes();
        let mut start = Revision::new(0, 0).to_bytes().to_vec();
        let mut deleted = 0usize;

        loop {
            let chunk = self.backend.scan(KEY_BUCKET, &start, &end, batch_limit)?;
            let next = match chunk.last() {
                Some((last, _)) => next_key(last),
                None => break,
            };

            let mut batch = WriteBatch::new();
            for (raw_key, _) in &chunk {
                if !keep.contains(&Revision::from_bytes(raw_key)?) {
                    batch.delete(KEY_BUCKET, raw_key);
                }
            }
            deleted += batch.len();
            self.backend.commit(batch)?;

            if chunk.len() < batch_limit {
                break;
            }
            start = next;
        }

        Ok(deleted)
    }

    /// Forces everything committed so far to durable storage.
    pub fn commit(&self) -> StorageResult<()> {
        self.ensure_open()?;
        self.backend.flush()?;
        Ok(())
    }

    /// Closes the store after any running compaction and write transaction finish.
    pub fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }

        let _compaction = self.compact_lock.lock();
        let _writer = self.write_lock.lock();
        self.backend.flush()?;

        info!("MVCC store closed at revision {}", self.current_revision());
        Ok(())
    }
}

/// A read-only view of the store at the revision current when it was opened.
pub struct ReadTxn<'a> {
    store: &'a Store,
    rev: i64,
    compact_main: i64,
}

impl ReadTxn<'_> {
    /// The oldest revision that can still be read.
    pub fn first_rev(&self) -> i64 {
        self.compact_main + 1
    }

    /// The store revision when the transaction was opened.
    pub fn rev(&self) -> i64 {
        self.rev
    }

    /// Gets the keys in `[key, end)` at `opts.rev` (or the transaction revision).
    ///
    /// `end` of `None` reads the single key; an empty end or `"\0"` reads every key from
    /// `key` onwards. Keys that are not live at the revision are left out.
    pub fn range(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        opts: RangeOptions,
    ) -> StorageResult<RangeResult> {
        self.store
            .range_at(key, end, opts, self.rev, self.compact_main)
    }
}

/// A pending change inside a write transaction.
#[derive(Clone, Debug)]
struct Change {
    rev: Revision,
    kv: KeyValue,
    tombstone: bool,
}

/// A write transaction. Changes become visible atomically on `commit`; dropping the
/// transaction discards them.
pub struct WriteTxn<'a> {
    store: &'a Store,
    _guard: MutexGuard<'a, ()>,
    begin_rev: i64,
    compact_main: i64,
    changes: Vec<Change>,
    /// Per-key state written in this txn: Some((create_revision, version)) or None if deleted
    pending: BTreeMap<Vec<u8>, Option<(i64, i64)>>,
}

impl WriteTxn<'_> {
    /// The store revision when the transaction was opened.
    pub fn rev(&self) -> i64 {
        self.begin_rev
    }

    pub fn first_rev(&self) -> i64 {
        self.compact_main + 1
    }

    /// The revision this transaction will commit at, or `rev()` if it changes nothing.
    fn result_rev(&self) -> i64 {
        if self.changes.is_empty() {
            self.begin_rev
        } else {
            self.begin_rev + 1
        }
    }

    fn next_revision(&self) -> Revision {
        Revision::new(self.begin_rev + 1, self.changes.len() as i64)
    }

    /// Reads committed state as of `rev()`; changes staged in this transaction are not
    /// visible.
    pub fn range(
        &self,
        key: &[u8],
        end: Option<&[u8]>,
        opts: RangeOptions,
    ) -> StorageResult<RangeResult> {
        self.store
            .range_at(key, end, opts, self.begin_rev, self.compact_main)
    }

    /// (create_revision, version) of `key` if it is live, accounting for staged changes.
    fn live_state(&self, key: &[u8]) -> Option<(i64, i64)> {
        match self.pending.get(key) {
            Some(state) => *state,
            None => self
                .store
                .index
                .get(key, self.begin_rev)
                .ok()
                .map(|(_, created, version)| (created.main, version)),
        }
    }

    /// Stages a put and returns the revision it will be visible at.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> StorageResult<i64> {
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("key is empty".to_string()));
        }

        let rev = self.next_revision();
        let (create_revision, version) = match self.live_state(key) {
            Some((created, version)) => (created, version + 1),
            None => (rev.main, 1),
        };

        self.pending
            .insert(key.to_vec(), Some((create_revision, version)));
        self.changes.push(Change {
            rev,
            kv: KeyValue {
                key: key.to_vec(),
                create_revision,
                mod_revision: rev.main,
                version,
                value: value.to_vec(),
            },
            tombstone: false,
        });

        debug!("Staged put of key {:?} at {:?}", String::from_utf8_lossy(key), rev);
        Ok(rev.main)
    }

    /// Stages deletion of every live key in the range.
    ///
    /// Returns the number of keys deleted and the revision the deletion is visible at.
    /// A range with no live keys changes nothing.
    pub fn delete_range(&mut self, key: &[u8], end: Option<&[u8]>) -> StorageResult<(i64, i64)> {
        let mut live: BTreeSet<Vec<u8>> = self
            .store
            .index
            .range(key, end, self.begin_rev)
            .into_iter()
            .map(|entry| entry.key)
            .collect();

        for (staged, state) in &self.pending {
            if !in_range(staged, key, end) {
                continue;
            }
            match state {
                Some(_) => live.insert(staged.clone()),
                None => live.remove(staged),
            };
        }

        let deleted = live.len() as i64;
        for k in live {
            let rev = self.next_revision();
            self.pending.insert(k.clone(), None);
            self.changes.push(Change {
                rev,
                kv: KeyValue {
                    key: k,
                    mod_revision: rev.main,
                    ..KeyValue::default()
                },
                tombstone: true,
            });
        }

        debug!(
            "Staged delete of {} keys in range {:?}..{:?}",
            deleted,
            String::from_utf8_lossy(key),
            end.map(String::from_utf8_lossy)
        );
        Ok((deleted, self.result_rev()))
    }

    /// Creates a backend bucket. Takes effect immediately, not at commit.
    pub fn create_bucket(&self, name: &str) -> StorageResult<()> {
        Self::check_bucket_name(name)?;
        self.store.backend.create_bucket(name)?;
        Ok(())
    }

    /// Deletes a backend bucket. Takes effect immediately, not at commit.
    pub fn delete_bucket(&self, name: &str) -> StorageResult<()> {
        Self::check_bucket_name(name)?;
        self.store.backend.delete_bucket(name)?;
        Ok(())
    }

    fn check_bucket_name(name: &str) -> StorageResult<()> {
        if name.is_empty() || name == KEY_BUCKET || name == META_BUCKET {
            return Err(StorageError::InvalidArgument(format!(
                "bucket name {:?} is reserved",
                name
            )));
        }
        Ok(())
    }

    /// Changes staged so far, in revision order.
    pub fn changes(&self) -> Vec<Event> {
        self.changes
            .iter()
            .map(|change| Event {
                event_type: if change.tombstone {
                    EventType::Delete
                } else {
                    EventType::Put
                },
                kv: change.kv.clone(),
            })
            .collect()
    }

    /// Writes the staged changes and publishes the new revision.
    ///
    /// Returns the store revision after the commit.
    pub fn commit(self) -> StorageResult<i64> {
        if self.changes.is_empty() {
            return Ok(self.begin_rev);
        }

        let main = self.begin_rev + 1;
        let mut batch = WriteBatch::new();
        for change in &self.changes {
            let encoded = change.kv.encode();
            if change.tombstone {
                batch.put(KEY_BUCKET, &change.rev.to_tombstone_bytes(), &encoded);
            } else {
                batch.put(KEY_BUCKET, &change.rev.to_bytes(), &encoded);
            }
        }
        self.store.backend.commit(batch)?;

        // Every sub revision is assigned; index updates stay invisible until the
        // revision advances below.
        for change in &self.changes {
            if change.tombstone {
                self.store.index.tombstone(&change.kv.key, change.rev)?;
            } else {
                self.store.index.put(&change.kv.key, change.rev);
            }
        }

        self.store.revs.write().current = main;

        debug!(
            "Committed write transaction at revision {} with {} changes",
            main,
            self.changes.len()
        );
        Ok(main)
    }
}

/// Returns the smallest key strictly greater than `key` in byte order.
pub(crate) fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Reads an 8-byte big-endian revision from the meta bucket.
pub(crate) fn read_meta_revision(backend: &Backend, key: &[u8]) -> StorageResult<Option<i64>> {
    match backend.get(META_BUCKET, key)? {
        None => Ok(None),
        Some(raw) => {
            let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                StorageError::Corrupt(format!(
                    "meta key {:?} holds {} bytes",
                    String::from_utf8_lossy(key),
                    raw.len()
                ))
            })?;
            Ok(Some(i64::from_be_bytes(bytes)))
        }
    }
}
