//! Per-key revision history.
//!
//! A key's history is a list of generations. A generation starts with the put that
//! (re)creates the key and ends with the tombstone that deletes it. After a tombstone an
//! empty generation is appended so the key can be created again:
//!
//! ```text
//! put(1.0); put(2.0); tombstone(3.0); put(4.0); tombstone(5.0)
//!
//! generations:
//!     {empty}
//!     {4.0, 5.0(t)}
//!     {1.0, 2.0, 3.0(t)}
//! ```
//!
//! Only the last generation may be empty. Compaction drops whole generations once their
//! tombstone falls at or below the compaction revision.

use std::collections::HashSet;

use crate::storage::{Revision, StorageError, StorageResult};

/// One create-to-delete lifetime of a key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Generation {
    /// Number of puts recorded in this generation (the tombstone counts as one)
    pub ver: i64,

    /// Revision of the first put in this generation
    pub created: Revision,

    /// Revisions in ascending order, ending with a tombstone once the generation closes
    pub revs: Vec<Revision>,
}

impl Generation {
    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// Walks revisions from newest to oldest until `f` returns false.
    /// Returns the position where the walk stopped.
    fn walk<F>(&self, mut f: F) -> Option<usize>
    where
        F: FnMut(&Revision) -> bool,
    {
        self.revs.iter().rposition(|rev| !f(rev))
    }
}

/// The revision history of a single key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyIndex {
    key: Vec<u8>,
    modified: Revision,
    generations: Vec<Generation>,
}

impl KeyIndex {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            modified: Revision::default(),
            generations: Vec::new(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Revision of the latest put or tombstone.
    pub fn modified(&self) -> Revision {
        self.modified
    }

    pub fn generations(&self) -> &[Generation] {
        &self.generations
    }

    /// True when the key has no history left: a single, empty generation (or none).
    pub fn is_empty(&self) -> bool {
        match self.generations.as_slice() {
            [] => true,
            [only] => only.is_empty(),
            _ => false,
        }
    }

    /// Records a put at `rev`.
    ///
    /// # Panics
    ///
    /// Panics if `rev` is not greater than the last recorded revision. Revisions are
    /// allocated by the store in strictly increasing order, so this is a caller bug.
    pub fn put(&mut self, rev: Revision) {
        if !rev.greater_than(&self.modified) {
            panic!(
                "put with unexpected smaller revision {:?} (modified {:?}, key {:?})",
                rev,
                self.modified,
                String::from_utf8_lossy(&self.key)
            );
        }

        if self.generations.is_empty() {
            self.generations.push(Generation::default());
        }

        let last = self.generations.len() - 1;
        let gen = &mut self.generations[last];
        if gen.is_empty() {
            gen.created = rev;
        }
        gen.revs.push(rev);
        gen.ver += 1;
        self.modified = rev;
    }

    /// Seeds the history during index rebuild from the first surviving revision of a key.
    ///
    /// # Panics
    ///
    /// Panics if the key index already has generations.
    pub fn restore(&mut self, created: Revision, modified: Revision, ver: i64) {
        if !self.generations.is_empty() {
            panic!(
                "restore on a non-empty key index (key {:?})",
                String::from_utf8_lossy(&self.key)
            );
        }

        self.modified = modified;
        self.generations.push(Generation {
            ver,
            created,
            revs: vec![modified],
        });
    }

    /// Closes the live generation with a tombstone at `rev`.
    ///
    /// Fails with `RevisionNotFound` when the key is not live.
    pub fn tombstone(&mut self, rev: Revision) -> StorageResult<()> {
        let live = self.generations.last().map_or(false, |gen| !gen.is_empty());
        if self.is_empty() || !live {
            return Err(StorageError::RevisionNotFound);
        }

        self.put(rev);
        self.generations.push(Generation::default());
        Ok(())
    }

    /// Resolves the key at `at_rev`.
    ///
    /// Returns the revision that holds the value visible at `at_rev`, the revision that
    /// created the key's generation, and the key's version at that point.
    pub fn get(&self, at_rev: i64) -> StorageResult<(Revision, Revision, i64)> {
        if self.is_empty() {
            return Err(StorageError::RevisionNotFound);
        }

        let gen = self
            .find_generation(at_rev)
            .ok_or(StorageError::RevisionNotFound)?;

        let n = gen
            .walk(|rev| rev.main > at_rev)
            .ok_or(StorageError::RevisionNotFound)?;

        let distance = (gen.revs.len() - n - 1) as i64;
        Ok((gen.revs[n], gen.created, gen.ver - distance))
    }

    /// Finds the generation in which the key was live at `at_rev`.
    fn find_generation(&self, at_rev: i64) -> Option<&Generation> {
        let last = self.generations.len().checked_sub(1)?;

        for (i, gen) in self.generations.iter().enumerate().rev() {
            let (first, tomb) = match (gen.revs.first(), gen.revs.last()) {
                (Some(first), Some(tomb)) => (first, tomb),
                _ => continue,
            };

            // A closed generation whose tombstone is visible means the key was deleted.
            if i != last && tomb.main <= at_rev {
                return None;
            }
            if first.main <= at_rev {
                return Some(gen);
            }
        }

        None
    }

    /// Drops history that cannot be observed by reads above `at_rev`.
    ///
    /// Revisions at or below `at_rev` that are still needed are added to `available`;
    /// the caller deletes every other backend entry at or below `at_rev`.
    pub fn compact(&mut self, at_rev: i64, available: &mut HashSet<Revision>) {
        if self.is_empty() {
            return;
        }

        let mut gen_idx = 0;
        // Skip every closed generation whose tombstone is already compacted.
        while gen_idx < self.generations.len() - 1 {
            let tomb = self.generations[gen_idx]
                .revs
                .last()
                .map_or(i64::MIN, |rev| rev.main);
            if tomb > at_rev {
                break;
            }
            gen_idx += 1;
        }

        let last = self.generations.len() - 1;
        let gen = &mut self.generations[gen_idx];
        if !gen.is_empty() {
            if let Some(n) = gen.walk(|rev| rev.main > at_rev) {
                available.insert(gen.revs[n]);
                gen.revs.drain(..n);
            }

            // A lone tombstone left in a closed generation carries no value.
            if gen.revs.len() == 1 && gen_idx != last && gen.revs[0].main <= at_rev {
                available.remove(&gen.revs[0]);
                gen_idx += 1;
            }
        }

        self.generations.drain(..gen_idx);
    }
}
