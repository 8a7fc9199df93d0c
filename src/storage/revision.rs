//! Revisions and their on-disk encoding.
//!
//! A revision is stored in the backend as a fixed-width, big-endian byte string so that
//! lexicographic order on the encoded bytes matches revision order. Range scans over the
//! key bucket (restore, compaction, event replay) depend on that property.

use crate::storage::{StorageError, StorageResult};

/// Byte length of an encoded revision: 8 bytes main, a `'_'`, 8 bytes sub.
pub const REV_BYTES_LEN: usize = 8 + 1 + 8;

/// Byte length of an encoded tombstone revision.
pub const MARKED_REV_BYTES_LEN: usize = REV_BYTES_LEN + 1;

const SEPARATOR: u8 = b'_';
const TOMBSTONE_MARK: u8 = b't';

/// A revision identifies one modification of the key space.
///
/// All changes committed in one transaction share `main`; `sub` orders them within it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Revision {
    /// Main revision of the transaction
    pub main: i64,
    /// Sub revision of the change inside the transaction
    pub sub: i64,
}

impl Revision {
    pub fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }

    pub fn greater_than(&self, other: &Revision) -> bool {
        self > other
    }

    /// Encodes the revision into its 17-byte backend key.
    pub fn to_bytes(&self) -> [u8; REV_BYTES_LEN] {
        let mut buf = [0u8; REV_BYTES_LEN];
        buf[..8].copy_from_slice(&self.main.to_be_bytes());
        buf[8] = SEPARATOR;
        buf[9..].copy_from_slice(&self.sub.to_be_bytes());
        buf
    }

    /// Encodes the revision with the trailing tombstone marker.
    pub fn to_tombstone_bytes(&self) -> [u8; MARKED_REV_BYTES_LEN] {
        let mut buf = [0u8; MARKED_REV_BYTES_LEN];
        buf[..REV_BYTES_LEN].copy_from_slice(&self.to_bytes());
        buf[REV_BYTES_LEN] = TOMBSTONE_MARK;
        buf
    }

    /// Decodes a revision from the first 17 bytes of a backend key.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < REV_BYTES_LEN || bytes[8] != SEPARATOR {
            return Err(StorageError::Corrupt(format!(
                "invalid revision key of {} bytes",
                bytes.len()
            )));
        }

        let mut main = [0u8; 8];
        let mut sub = [0u8; 8];
        main.copy_from_slice(&bytes[..8]);
        sub.copy_from_slice(&bytes[9..REV_BYTES_LEN]);

        Ok(Self {
            main: i64::from_be_bytes(main),
            sub: i64::from_be_bytes(sub),
        })
    }
}

/// Reports whether a backend key is a tombstone revision.
pub fn is_tombstone(bytes: &[u8]) -> bool {
    bytes.len() == MARKED_REV_BYTES_LEN && bytes[MARKED_REV_BYTES_LEN - 1] == TOMBSTONE_MARK
}
