//! Index rebuild from the backend revision log.
//!
//! The index lives only in memory, so opening a store replays the key bucket. The scan
//! runs on the caller's thread and reads the log in chunks; decoded entries go through a
//! bounded channel to a rebuild thread that re-keys them by logical key. The rebuild
//! thread keeps recently touched key histories in an LRU cache of the same size as a
//! chunk and hands evicted entries to the tree index, so memory stays bounded by the
//! chunk size rather than by the number of revisions.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use lru::LruCache;
use tracing::{debug, info, warn};

use crate::storage::mvcc::{next_key, read_meta_revision, KeyValue};
use crate::storage::revision::is_tombstone;
use crate::storage::{
    Backend, KeyIndex, Revision, StorageError, StorageResult, TreeIndex, KEY_BUCKET,
};

/// Meta key holding the main revision of the last finished compaction.
pub const FINISHED_COMPACT_KEY: &[u8] = b"finishedCompactRev";

/// Meta key holding the main revision of the last scheduled compaction.
pub const SCHEDULED_COMPACT_KEY: &[u8] = b"scheduledCompactRev";

/// Revision counters recovered from the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Revision of the last committed transaction
    pub current_rev: i64,
    /// Main revision of the last finished compaction, -1 if none
    pub compact_main_rev: i64,
    /// Main revision of a compaction that was scheduled but not finished, if any
    pub pending_compaction: Option<i64>,
    /// Number of log entries replayed
    pub entries: usize,
}

/// One decoded entry of the revision log.
#[derive(Clone, Debug)]
struct LoggedRevision {
    key: Vec<u8>,
    rev: Revision,
    tombstone: bool,
    create_revision: i64,
    version: i64,
}

impl LoggedRevision {
    fn decode(raw_key: &[u8], raw_value: &[u8]) -> StorageResult<Self> {
        let rev = Revision::from_bytes(raw_key)?;
        let kv = KeyValue::decode(raw_value)?;
        Ok(Self {
            key: kv.key,
            rev,
            tombstone: is_tombstone(raw_key),
            create_revision: kv.create_revision,
            version: kv.version,
        })
    }
}

/// Rebuilds `index` from the backend and recovers the revision counters.
///
/// Blocks until the rebuild thread has drained. Closing or signalling `cancel` aborts the
/// restore with an error; the index must then be discarded.
pub fn restore(
    backend: &Backend,
    index: &Arc<TreeIndex>,
    chunk_keys: usize,
    cancel: &Receiver<()>,
) -> StorageResult<RestoreOutcome> {
    let chunk_keys = chunk_keys.max(1);

    // Counters first, so a retried restore always starts from the persisted boundary.
    let compact_main_rev = read_meta_revision(backend, FINISHED_COMPACT_KEY)
        .map_err(|e| StorageError::Restore(format!("read finished compaction: {}", e)))?
        .unwrap_or(-1);
    let scheduled = read_meta_revision(backend, SCHEDULED_COMPACT_KEY)
        .map_err(|e| StorageError::Restore(format!("read scheduled compaction: {}", e)))?;
    let pending_compaction = scheduled.filter(|rev| *rev > compact_main_rev);

    let (tx, rx) = crossbeam_channel::bounded::<LoggedRevision>(chunk_keys);
    let rebuild_index = Arc::clone(index);
    let rebuilder = thread::Builder::new()
        .name("mvcc-restore".to_string())
        .spawn(move || rebuild_index_from(rebuild_index, rx, chunk_keys))?;

    // The sender is moved into the scan and dropped when it returns, ending the rebuild.
    let scanned = scan_revision_log(backend, tx, chunk_keys, cancel);
    let last_main = rebuilder
        .join()
        .map_err(|_| StorageError::Restore("index rebuild thread panicked".to_string()))?;
    let entries = scanned?;

    let current_rev = last_main
        .max(compact_main_rev)
        .max(pending_compaction.unwrap_or(0))
        .max(1);

    info!(
        "Restored {} log entries into {} keys (current_rev={}, compact_rev={})",
        entries,
        index.len(),
        current_rev,
        compact_main_rev
    );

    Ok(RestoreOutcome {
        current_rev,
        compact_main_rev,
        pending_compaction,
        entries,
    })
}

/// Streams the key bucket in revision order into `tx`, one chunk at a time.
fn scan_revision_log(
    backend: &Backend,
    tx: Sender<LoggedRevision>,
    chunk_keys: usize,
    cancel: &Receiver<()>,
) -> StorageResult<usize> {
    let mut start = Revision::new(1, 0).to_bytes().to_vec();
    let mut total = 0usize;

    loop {
        if !matches!(cancel.try_recv(), Err(TryRecvError::Empty)) {
            return Err(StorageError::Restore("restore cancelled".to_string()));
        }

        let chunk = backend
            .scan(KEY_BUCKET, &start, b"", chunk_keys)
            .map_err(|e| StorageError::Restore(format!("scan revision log: {}", e)))?;
        let next = match chunk.last() {
            Some((last, _)) => next_key(last),
            None => break,
        };
        let len = chunk.len();

        for (raw_key, raw_value) in chunk {
            let entry = LoggedRevision::decode(&raw_key, &raw_value)
                .map_err(|e| StorageError::Restore(format!("decode revision log: {}", e)))?;

            select! {
                send(tx, entry) -> sent => {
                    if sent.is_err() {
                        return Err(StorageError::Restore("index rebuild stopped".to_string()));
                    }
                }
                recv(cancel) -> _ => {
                    return Err(StorageError::Restore("restore cancelled".to_string()));
                }
            }
        }

        total += len;
        if len < chunk_keys {
            break;
        }
        start = next;
    }

    Ok(total)
}

/// Consumes log entries and rebuilds key histories. Returns the last main revision seen.
fn rebuild_index_from(index: Arc<TreeIndex>, rx: Receiver<LoggedRevision>, capacity: usize) -> i64 {
    let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
    let mut cache: LruCache<Vec<u8>, KeyIndex> = LruCache::new(capacity);
    let mut last_main = 0;

    for entry in rx {
        last_main = entry.rev.main;

        // Cache miss: resume an entry built earlier and already handed to the tree.
        if !cache.contains(&entry.key) {
            if let Some(ki) = index.take(&entry.key) {
                cache_key_index(&mut cache, &index, ki);
            }
        }

        match cache.get_mut(&entry.key) {
            Some(ki) if entry.tombstone => {
                if ki.tombstone(entry.rev).is_err() {
                    warn!(
                        "Restore: tombstone for deleted key {:?} at {:?}",
                        String::from_utf8_lossy(&entry.key),
                        entry.rev
                    );
                }
            }
            Some(ki) => ki.put(entry.rev),
            // Remnant of a compacted generation.
            None if entry.tombstone => {
                debug!(
                    "Restore: skipping tombstone of compacted key {:?} at {:?}",
                    String::from_utf8_lossy(&entry.key),
                    entry.rev
                );
            }
            None => {
                // The envelope only keeps the creating main revision; a first version
                // is its own creation.
                let created = if entry.version == 1 {
                    entry.rev
                } else {
                    Revision::new(entry.create_revision, 0)
                };
                let mut ki = KeyIndex::new(entry.key);
                ki.restore(created, entry.rev, entry.version);
                cache_key_index(&mut cache, &index, ki);
            }
        }
    }

    while let Some((_, ki)) = cache.pop_lru() {
        index.insert(ki);
    }

    last_main
}

fn cache_key_index(cache: &mut LruCache<Vec<u8>, KeyIndex>, index: &TreeIndex, ki: KeyIndex) {
    if let Some((_, evicted)) = cache.push(ki.key().to_vec(), ki) {
        index.insert(evicted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackendConfig, WriteBatch};
    use tempfile::TempDir;

    fn open_backend(temp_dir: &TempDir) -> Arc<Backend> {
        Backend::new(BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            cache_size_mb: 16,
            flush_interval_ms: 0,
            sync_on_commit: false,
        })
        .unwrap()
    }

    fn log_put(batch: &mut WriteBatch, key: &[u8], rev: Revision, created: i64, version: i64) {
        let kv = KeyValue {
            key: key.to_vec(),
            create_revision: created,
            mod_revision: rev.main,
            version,
            value: format!("v{}", rev.main).into_bytes(),
        };
        batch.put(KEY_BUCKET, &rev.to_bytes(), &kv.encode());
    }

    fn log_tombstone(batch: &mut WriteBatch, key: &[u8], rev: Revision) {
        let kv = KeyValue {
            key: key.to_vec(),
            mod_revision: rev.main,
            ..KeyValue::default()
        };
        batch.put(KEY_BUCKET, &rev.to_tombstone_bytes(), &kv.encode());
    }

    #[test]
    fn test_restore_empty_log() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open_backend(&temp_dir);
        let index = Arc::new(TreeIndex::new());

        let outcome = restore(&backend, &index, 4, &crossbeam_channel::never()).unwrap();
        assert_eq!(
            outcome,
            RestoreOutcome {
                current_rev: 1,
                compact_main_rev: -1,
                pending_compaction: None,
                entries: 0,
            }
        );
        assert!(index.is_empty());
    }

    #[test]
    fn test_restore_matches_direct_index() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open_backend(&temp_dir);
        let direct = TreeIndex::new();
        let mut batch = WriteBatch::new();

        // foo: put 2, put 3, tombstone 4, put 6; bar: put 2.1, put 5; baz: put 3.1, tombstone 7
        let (foo, bar, baz): (&[u8], &[u8], &[u8]) = (b"foo", b"bar", b"baz");
        let ops = vec![
            (foo, Revision::new(2, 0), false, 2, 1),
            (bar, Revision::new(2, 1), false, 2, 1),
            (foo, Revision::new(3, 0), false, 2, 2),
            (baz, Revision::new(3, 1), false, 3, 1),
            (foo, Revision::new(4, 0), true, 0, 0),
            (bar, Revision::new(5, 0), false, 2, 2),
            (foo, Revision::new(6, 0), false, 6, 1),
            (baz, Revision::new(7, 0), true, 0, 0),
        ];
        for (key, rev, tombstone, created, version) in &ops {
            if *tombstone {
                log_tombstone(&mut batch, key, *rev);
                direct.tombstone(key, *rev).unwrap();
            } else {
                log_put(&mut batch, key, *rev, *created, *version);
                direct.put(key, *rev);
            }
        }
        backend.commit(batch).unwrap();

        // A chunk size of 2 forces evictions and re-adoption of keys across chunks.
        let restored = Arc::new(TreeIndex::new());
        let outcome = restore(&backend, &restored, 2, &crossbeam_channel::never()).unwrap();
        assert_eq!(outcome.current_rev, 7);
        assert_eq!(outcome.entries, ops.len());
        assert_eq!(restored.len(), direct.len());

        for key in [foo, bar, baz] {
            for at in 0..=8 {
                assert_eq!(
                    restored.get(key, at).ok(),
                    direct.get(key, at).ok(),
                    "key {:?} at revision {}",
                    String::from_utf8_lossy(key),
                    at
                );
            }
        }
    }

    #[test]
    fn test_restore_after_compaction_seeds_from_envelope() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open_backend(&temp_dir);
        let mut batch = WriteBatch::new();

        // Earlier revisions of "foo" were compacted away; the log starts mid-generation.
        log_tombstone(&mut batch, b"gone", Revision::new(4, 0));
        log_put(&mut batch, b"foo", Revision::new(5, 0), 2, 3);
        log_put(&mut batch, b"foo", Revision::new(8, 0), 2, 4);
        batch.put(
            crate::storage::META_BUCKET,
            FINISHED_COMPACT_KEY,
            &5i64.to_be_bytes(),
        );
        backend.commit(batch).unwrap();

        let index = Arc::new(TreeIndex::new());
        let outcome = restore(&backend, &index, 16, &crossbeam_channel::never()).unwrap();
        assert_eq!(outcome.compact_main_rev, 5);
        assert_eq!(outcome.current_rev, 8);
        assert_eq!(outcome.pending_compaction, None);

        assert!(index.get(b"gone", 8).is_err());
        assert_eq!(
            index.get(b"foo", 6).unwrap(),
            (Revision::new(5, 0), Revision::new(2, 0), 3)
        );
        assert_eq!(
            index.get(b"foo", 8).unwrap(),
            (Revision::new(8, 0), Revision::new(2, 0), 4)
        );
    }

    #[test]
    fn test_restore_reports_pending_compaction() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open_backend(&temp_dir);
        backend
            .put(crate::storage::META_BUCKET, FINISHED_COMPACT_KEY, &3i64.to_be_bytes())
            .unwrap();
        backend
            .put(crate::storage::META_BUCKET, SCHEDULED_COMPACT_KEY, &9i64.to_be_bytes())
            .unwrap();

        let index = Arc::new(TreeIndex::new());
        let outcome = restore(&backend, &index, 16, &crossbeam_channel::never()).unwrap();
        assert_eq!(outcome.compact_main_rev, 3);
        assert_eq!(outcome.pending_compaction, Some(9));
        assert_eq!(outcome.current_rev, 9);
    }

    #[test]
    fn test_restore_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open_backend(&temp_dir);
        let mut batch = WriteBatch::new();
        for main in 1..=64 {
            log_put(&mut batch, b"foo", Revision::new(main, 0), 1, main);
        }
        backend.commit(batch).unwrap();

        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        drop(cancel_tx);

        let index = Arc::new(TreeIndex::new());
        let result = restore(&backend, &index, 1, &cancel_rx);
        assert!(matches!(result, Err(StorageError::Restore(_))));
    }

    #[test]
    fn test_restore_rejects_corrupt_entry() {
        let temp_dir = TempDir::new().unwrap();
        let backend = open_backend(&temp_dir);
        backend
            .put(KEY_BUCKET, &Revision::new(1, 0).to_bytes(), b"garbage")
            .unwrap();

        let index = Arc::new(TreeIndex::new());
        let result = restore(&backend, &index, 16, &crossbeam_channel::never());
        assert!(matches!(result, Err(StorageError::Restore(_))));
    }
}
