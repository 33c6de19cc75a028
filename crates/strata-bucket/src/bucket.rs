//! The immutable, content-addressed bucket.
//!
//! A bucket is a handle to an immutable sorted run of entries persisted
//! as a gzip-compressed record stream, identified by the SHA-256 of its
//! uncompressed contents. The canonical empty bucket has the all-zero
//! hash and no backing file.
//!
//! Buckets are shared via `Arc` between the bucket list's level slots
//! and the manager's dedup table; the file outlives every holder and is
//! only ever deleted by the manager's garbage-collection sweep.

use std::path::{Path, PathBuf};

use strata_common::Hash256;

use crate::entry::{BucketEntry, EntryKey};
use crate::iterator::{scan_bucket_file, BucketInputIter};
use crate::{BucketError, Result};

/// An immutable bucket file containing sorted ledger entries.
#[derive(Clone)]
pub struct Bucket {
    /// SHA-256 of the uncompressed record stream.
    hash: Hash256,
    /// Backing file path; empty for the canonical empty bucket.
    filename: PathBuf,
    /// Number of records in the file.
    object_count: u64,
    /// Uncompressed stream length in bytes.
    byte_size: u64,
}

impl Bucket {
    /// The canonical empty bucket: zero hash, no backing file.
    pub fn empty() -> Self {
        Self {
            hash: Hash256::ZERO,
            filename: PathBuf::new(),
            object_count: 0,
            byte_size: 0,
        }
    }

    /// Build a bucket handle from a known identity and file.
    ///
    /// Callers must have derived `hash` and the counts from the file's
    /// actual contents (writer output or a scan).
    pub(crate) fn from_parts(
        hash: Hash256,
        filename: PathBuf,
        object_count: u64,
        byte_size: u64,
    ) -> Self {
        Self {
            hash,
            filename,
            object_count,
            byte_size,
        }
    }

    /// Scan an existing file and build a handle from what is actually
    /// on disk.
    pub fn open(path: &Path) -> Result<Self> {
        let scan = scan_bucket_file(path)?;
        Ok(Self::from_parts(
            scan.hash,
            path.to_path_buf(),
            scan.object_count,
            scan.byte_size,
        ))
    }

    /// The content hash identifying this bucket.
    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    /// Path of the backing file; empty for the canonical empty bucket.
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Number of records in this bucket.
    pub fn count(&self) -> u64 {
        self.object_count
    }

    /// Uncompressed byte length of this bucket's record stream.
    pub fn size(&self) -> u64 {
        self.byte_size
    }

    /// Whether this is the canonical empty bucket.
    pub fn is_empty(&self) -> bool {
        self.hash.is_zero()
    }

    /// Stream this bucket's entries in file order.
    pub fn iter(&self) -> Result<BucketInputIter> {
        if self.is_empty() {
            Ok(BucketInputIter::empty())
        } else {
            BucketInputIter::open(&self.filename)
        }
    }

    /// Look up an entry by key.
    ///
    /// Streams the sorted file and stops at the first key past the
    /// target, so a miss costs at most one pass over the smaller prefix.
    pub fn get(&self, key: &EntryKey) -> Result<Option<BucketEntry>> {
        let mut iter = self.iter()?;
        while let Some(entry) = iter.next_entry()? {
            match entry.key() {
                Some(entry_key) if entry_key == key => return Ok(Some(entry)),
                Some(entry_key) if entry_key > key => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Protocol version recorded in this bucket's metadata record, if
    /// present.
    ///
    /// The metadata record is always first, so this reads at most one
    /// record.
    pub fn protocol_version(&self) -> Result<Option<u32>> {
        let mut iter = self.iter()?;
        match iter.next_entry()? {
            Some(BucketEntry::Metadata(meta)) => Ok(Some(meta.protocol_version)),
            _ => Ok(None),
        }
    }

    /// Re-scan the backing file and verify it still matches this
    /// bucket's recorded identity.
    ///
    /// A mismatch means on-disk corruption and is fatal; continuing
    /// would diverge this node's state hash from the network.
    pub fn verify(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let scan = scan_bucket_file(&self.filename)?;
        if scan.hash != self.hash {
            return Err(BucketError::HashMismatch {
                expected: self.hash.to_hex(),
                actual: scan.hash.to_hex(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("hash", &self.hash.to_hex())
            .field("objects", &self.object_count)
            .field("bytes", &self.byte_size)
            .finish()
    }
}

impl PartialEq for Bucket {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Bucket {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{BucketMetadata, LedgerEntry};
    use crate::iterator::BucketOutputIter;
    use tempfile::TempDir;

    fn write_bucket(dir: &Path, name: &str, entries: &[BucketEntry]) -> Bucket {
        let path = dir.join(name);
        let mut writer = BucketOutputIter::create(path.clone()).unwrap();
        for entry in entries {
            writer.put(entry).unwrap();
        }
        let out = writer.finish().unwrap().unwrap();
        Bucket::from_parts(out.hash, path, out.object_count, out.byte_size)
    }

    fn make_live(seed: u8, value: &[u8]) -> BucketEntry {
        BucketEntry::Live(LedgerEntry::new(vec![seed; 4], value))
    }

    #[test]
    fn test_empty_bucket() {
        let bucket = Bucket::empty();
        assert!(bucket.is_empty());
        assert_eq!(bucket.count(), 0);
        assert_eq!(bucket.hash(), Hash256::ZERO);
        assert!(bucket.iter().unwrap().next_entry().unwrap().is_none());
        bucket.verify().unwrap();
    }

    #[test]
    fn test_get_streams_sorted_file() {
        let dir = TempDir::new().unwrap();
        let bucket = write_bucket(
            dir.path(),
            "a.bucket.gz",
            &[make_live(1, b"one"), make_live(3, b"three")],
        );

        let hit = bucket.get(&EntryKey::new(vec![1u8; 4])).unwrap().unwrap();
        assert_eq!(hit.as_ledger_entry().unwrap().value, b"one");

        // Key between the two present keys: miss, found via early exit.
        assert!(bucket.get(&EntryKey::new(vec![2u8; 4])).unwrap().is_none());
        assert!(bucket.get(&EntryKey::new(vec![9u8; 4])).unwrap().is_none());
    }

    #[test]
    fn test_open_rederives_identity() {
        let dir = TempDir::new().unwrap();
        let written = write_bucket(dir.path(), "a.bucket.gz", &[make_live(1, b"v")]);

        let opened = Bucket::open(written.filename()).unwrap();
        assert_eq!(opened.hash(), written.hash());
        assert_eq!(opened.count(), written.count());
        assert_eq!(opened.size(), written.size());
    }

    #[test]
    fn test_protocol_version_probe() {
        let dir = TempDir::new().unwrap();
        let with_meta = write_bucket(
            dir.path(),
            "meta.bucket.gz",
            &[
                BucketEntry::Metadata(BucketMetadata {
                    protocol_version: 9,
                }),
                make_live(1, b"v"),
            ],
        );
        assert_eq!(with_meta.protocol_version().unwrap(), Some(9));

        let without_meta = write_bucket(dir.path(), "plain.bucket.gz", &[make_live(1, b"v")]);
        assert_eq!(without_meta.protocol_version().unwrap(), None);
    }

    #[test]
    fn test_verify_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let bucket = write_bucket(dir.path(), "a.bucket.gz", &[make_live(1, b"v")]);
        bucket.verify().unwrap();

        // Replace the file with a different valid stream.
        let other = write_bucket(dir.path(), "b.bucket.gz", &[make_live(2, b"w")]);
        std::fs::copy(other.filename(), bucket.filename()).unwrap();

        match bucket.verify() {
            Err(BucketError::HashMismatch { .. }) => {}
            other => panic!("expected hash mismatch, got {other:?}"),
        }
    }
}
