//! In-memory tree index over every key ever written (etcd's treeIndex).
//!
//! The index maps key bytes to their `KeyIndex` history in a `BTreeMap` so that point
//! lookups and ordered range scans at a historical revision are O(log n) in the number of
//! distinct keys, independent of the number of revisions.
//!
//! Locking:
//! - Lookups take the read lock for a single key or a single range scan.
//! - Mutations take the write lock for one key at a time.
//! - Compaction walks the tree in batches and locks each key separately, so a long sweep
//!   never stalls writers on unrelated keys.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

use parking_lot::RwLock;
use tracing::debug;

use crate::storage::{KeyIndex, Revision, StorageError, StorageResult};

/// A key resolved at a revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    /// Revision holding the visible value
    pub modified: Revision,
    /// Revision that created the key's current generation
    pub created: Revision,
    pub version: i64,
}

/// Returns the upper bound for a `[key, end)` range.
///
/// `None` selects the single key, an empty end or `"\0"` selects every key from `key`.
pub(crate) fn range_end_bound<'a>(key: &'a [u8], end: Option<&'a [u8]>) -> Bound<&'a [u8]> {
    match end {
        None => Bound::Included(key),
        Some(end) if end.is_empty() || end == b"\0" => Bound::Unbounded,
        Some(end) => Bound::Excluded(end),
    }
}

/// Reports whether `candidate` falls within the range selected by `key`/`end`.
pub(crate) fn in_range(candidate: &[u8], key: &[u8], end: Option<&[u8]>) -> bool {
    if candidate < key {
        return false;
    }
    match range_end_bound(key, end) {
        Bound::Included(k) => candidate == k,
        Bound::Excluded(e) => candidate < e,
        Bound::Unbounded => true,
    }
}

/// Thread-safe ordered index of key histories.
pub struct TreeIndex {
    tree: RwLock<BTreeMap<Vec<u8>, KeyIndex>>,
}

impl TreeIndex {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
        }
    }

    /// Records a put of `key` at `rev`, creating the key's history on first sight.
    pub fn put(&self, key: &[u8], rev: Revision) {
        let mut tree = self.tree.write();
        tree.entry(key.to_vec())
            .or_insert_with(|| KeyIndex::new(key.to_vec()))
            .put(rev);

        debug!(
            "Index: put key {:?} at revision {:?}",
            String::from_utf8_lossy(key),
            rev
        );
    }

    /// Resolves `key` at `at_rev` to `(modified, created, version)`.
    pub fn get(&self, key: &[u8], at_rev: i64) -> StorageResult<(Revision, Revision, i64)> {
        let tree = self.tree.read();
        tree.get(key)
            .ok_or(StorageError::RevisionNotFound)?
            .get(at_rev)
    }

    /// Records the deletion of `key` at `rev`.
    pub fn tombstone(&self, key: &[u8], rev: Revision) -> StorageResult<()> {
        let mut tree = self.tree.write();
        tree.get_mut(key)
            .ok_or(StorageError::RevisionNotFound)?
            .tombstone(rev)?;

        debug!(
            "Index: tombstone key {:?} at revision {:?}",
            String::from_utf8_lossy(key),
            rev
        );
        Ok(())
    }

    /// Returns every key in the range that is live at `at_rev`, in key order.
    pub fn range(&self, key: &[u8], end: Option<&[u8]>, at_rev: i64) -> Vec<IndexEntry> {
        let tree = self.tree.read();
        let upper = range_end_bound(key, end);
        if let Bound::Excluded(e) = upper {
            if e <= key {
                return Vec::new();
            }
        }

        tree.range::<[u8], _>((Bound::Included(key), upper))
            .filter_map(|(k, ki)| {
                ki.get(at_rev).ok().map(|(modified, created, version)| IndexEntry {
                    key: k.clone(),
                    modified,
                    created,
                    version,
                })
            })
            .collect()
    }

    /// Inserts or replaces a fully built key history. Used by the restore pipeline.
    pub fn insert(&self, ki: KeyIndex) {
        let mut tree = self.tree.write();
        tree.insert(ki.key().to_vec(), ki);
    }

    /// Removes and returns a key history. Used by the restore pipeline to resume building
    /// an entry it previously handed to the tree.
    pub fn take(&self, key: &[u8]) -> Option<KeyIndex> {
        self.tree.write().remove(key)
    }

    /// Compacts every key history at `at_rev`, removing keys with nothing left.
    ///
    /// Returns the revisions at or below `at_rev` that must survive in the backend.
    pub fn compact(&self, at_rev: i64, batch_size: usize) -> HashSet<Revision> {
        let mut available = HashSet::new();
        let mut removed = 0usize;
        let mut cursor: Option<Vec<u8>> = None;

        loop {
            let keys = self.keys_after(cursor.as_deref(), batch_size.max(1));
            let Some(last) = keys.last().cloned() else {
                break;
            };

            for key in keys {
                let mut tree = self.tree.write();
                if let Some(ki) = tree.get_mut(&key) {
                    ki.compact(at_rev, &mut available);
                    if ki.is_empty() {
                        tree.remove(&key);
                        removed += 1;
                    }
                }
            }
            cursor = Some(last);
        }

        debug!(
            "Index: compacted at revision {} ({} keys removed, {} revisions kept)",
            at_rev,
            removed,
            available.len()
        );
        available
    }

    /// Lists up to `limit` keys strictly after `after`.
    fn keys_after(&self, after: Option<&[u8]>, limit: usize) -> Vec<Vec<u8>> {
        let tree = self.tree.read();
        let lower = match after {
            Some(k) => Bound::Excluded(k),
            None => Bound::Unbounded,
        };
        tree.range::<[u8], _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Counts the revisions currently held for a key.
    #[cfg(test)]
    pub fn count_revisions(&self, key: &[u8]) -> usize {
        self.tree
            .read()
            .get(key)
            .map(|ki| ki.generations().iter().map(|gen| gen.revs.len()).sum())
            .unwrap_or(0)
    }

    /// Returns the number of keys with history in the index.
    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }
}

impl Default for TreeIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(main: i64) -> Revision {
        Revision::new(main, 0)
    }

    #[test]
    fn test_put_and_get() {
        let index = TreeIndex::new();

        index.put(b"key1", rev(2));

        assert_eq!(index.get(b"key1", 2).unwrap(), (rev(2), rev(2), 1));
        assert!(matches!(index.get(b"key1", 1), Err(StorageError::RevisionNotFound)));
        assert_eq!(index.get(b"key1", 3).unwrap(), (rev(2), rev(2), 1));
        assert!(matches!(index.get(b"missing", 3), Err(StorageError::RevisionNotFound)));
    }

    #[test]
    fn test_multiple_updates() {
        let index = TreeIndex::new();

        index.put(b"key1", rev(1));
        index.put(b"key1", rev(3));

        assert_eq!(index.get(b"key1", 2).unwrap().0, rev(1));
        assert_eq!(index.get(b"key1", 3).unwrap(), (rev(3), rev(1), 2));
        assert_eq!(index.get(b"key1", 5).unwrap().0, rev(3));
    }

    #[test]
    fn test_tombstone() {
        let index = TreeIndex::new();

        index.put(b"key1", rev(1));
        index.tombstone(b"key1", rev(3)).unwrap();

        assert_eq!(index.get(b"key1", 2).unwrap().0, rev(1));
        assert!(index.get(b"key1", 3).is_err());

        assert!(matches!(
            index.tombstone(b"key1", rev(4)),
            Err(StorageError::RevisionNotFound)
        ));
        assert!(matches!(
            index.tombstone(b"never", rev(5)),
            Err(StorageError::RevisionNotFound)
        ));
    }

    #[test]
    fn test_range() {
        let index = TreeIndex::new();

        index.put(b"a", Revision::new(1, 0));
        index.put(b"b", Revision::new(1, 1));
        index.put(b"c", Revision::new(1, 2));
        index.put(b"d", Revision::new(1, 3));
        index.tombstone(b"c", rev(2)).unwrap();

        let results = index.range(b"b", Some(b"d"), 1);
        let keys: Vec<&[u8]> = results.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"b"[..], &b"c"[..]]);
        assert_eq!(results[0].modified, Revision::new(1, 1));

        let results = index.range(b"b", Some(b"d"), 2);
        assert_eq!(results.len(), 1);

        assert_eq!(index.range(b"b", None, 2).len(), 1);
        assert_eq!(index.range(b"b", Some(b""), 2).len(), 2);
        assert_eq!(index.range(b"a", Some(b"\0"), 1).len(), 4);
        assert!(index.range(b"d", Some(b"a"), 1).is_empty());
    }

    #[test]
    fn test_in_range() {
        assert!(in_range(b"b", b"b", None));
        assert!(!in_range(b"bb", b"b", None));
        assert!(in_range(b"bb", b"b", Some(b"c")));
        assert!(!in_range(b"c", b"b", Some(b"c")));
        assert!(in_range(b"zzz", b"b", Some(b"")));
        assert!(!in_range(b"a", b"b", Some(b"")));
    }

    #[test]
    fn test_insert_and_take() {
        let index = TreeIndex::new();
        let mut ki = KeyIndex::new(b"foo".to_vec());
        ki.restore(rev(2), rev(4), 3);
        index.insert(ki);

        assert_eq!(index.get(b"foo", 4).unwrap(), (rev(4), rev(2), 3));

        let taken = index.take(b"foo").unwrap();
        assert_eq!(taken.modified(), rev(4));
        assert!(index.is_empty());
        assert!(index.take(b"foo").is_none());
    }

    #[test]
    fn test_compaction() {
        let index = TreeIndex::new();

        index.put(b"key1", rev(1));
        index.put(b"key1", rev(3));
        index.put(b"key1", rev(5));
        assert_eq!(index.count_revisions(b"key1"), 3);

        let available = index.compact(4, 16);
        assert_eq!(available, HashSet::from([rev(3)]));
        assert_eq!(index.count_revisions(b"key1"), 2);
        assert_eq!(index.get(b"key1", 4).unwrap().0, rev(3));
        assert_eq!(index.get(b"key1", 5).unwrap().0, rev(5));
    }

    #[test]
    fn test_compaction_removes_dead_keys_across_batches() {
        let index = TreeIndex::new();
        let mut main = 1;
        for i in 0..10 {
            let key = format!("key{}", i);
            index.put(key.as_bytes(), rev(main));
            main += 1;
            if i % 2 == 0 {
                index.tombstone(key.as_bytes(), rev(main)).unwrap();
                main += 1;
            }
        }
        assert_eq!(index.len(), 10);

        let available = index.compact(main, 3);
        assert_eq!(index.len(), 5);
        assert_eq!(available.len(), 5);
        for i in (1..10).step_by(2) {
            let key = format!("key{}", i);
            assert!(index.get(key.as_bytes(), main).is_ok());
        }
    }
}
