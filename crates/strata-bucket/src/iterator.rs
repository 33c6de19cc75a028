//! Streaming bucket file iterators.
//!
//! Bucket files are processed without ever materializing them in memory:
//!
//! - [`BucketInputIter`] streams entries from a bucket file sequentially.
//! - [`BucketOutputIter`] writes entries to a new file while hashing the
//!   uncompressed record stream incrementally, so the bucket's identity
//!   is known the moment the last record is written.
//!
//! Merges wire one output iterator to two input iterators; adoption and
//! verification use [`scan_bucket_file`] to re-derive a file's identity.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use strata_common::Hash256;

use crate::entry::BucketEntry;
use crate::{BucketError, Result};

/// High bit of a record mark, flagging the final fragment of a record.
const RECORD_MARK_FLAG: u32 = 0x8000_0000;

/// Read one framed record payload from the stream.
///
/// Returns `Ok(None)` at a clean end of stream; a partial record mark or
/// truncated payload is a serialization error.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut mark_buf = [0u8; 4];
    match reader.read_exact(&mut mark_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BucketError::Io(e)),
    }

    let mark = u32::from_be_bytes(mark_buf);
    if mark & RECORD_MARK_FLAG == 0 {
        return Err(BucketError::Serialization(format!(
            "record mark {mark:#010x} missing final-fragment flag"
        )));
    }
    let len = (mark & !RECORD_MARK_FLAG) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            BucketError::Serialization(format!("truncated record of length {len}"))
        } else {
            BucketError::Io(e)
        }
    })?;

    Ok(Some(payload))
}

/// Streams entries out of a gzip-compressed bucket file.
///
/// An iterator with no backing reader (the canonical empty bucket)
/// yields nothing.
pub struct BucketInputIter {
    reader: Option<GzDecoder<BufReader<File>>>,
    bytes_read: u64,
    entries_read: u64,
}

impl BucketInputIter {
    /// Open a bucket file for streaming.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: Some(GzDecoder::new(BufReader::new(file))),
            bytes_read: 0,
            entries_read: 0,
        })
    }

    /// An iterator over the canonical empty bucket.
    pub fn empty() -> Self {
        Self {
            reader: None,
            bytes_read: 0,
            entries_read: 0,
        }
    }

    /// Read the next entry, or `None` at end of stream.
    pub fn next_entry(&mut self) -> Result<Option<BucketEntry>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };

        match read_record(reader)? {
            Some(payload) => {
                self.bytes_read += 4 + payload.len() as u64;
                self.entries_read += 1;
                Ok(Some(BucketEntry::decode_payload(&payload)?))
            }
            None => Ok(None),
        }
    }

    /// Uncompressed bytes consumed so far, record marks included.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Entries decoded so far.
    pub fn entries_read(&self) -> u64 {
        self.entries_read
    }
}

/// Result of finishing a [`BucketOutputIter`]: the written file plus the
/// identity and counts derived while writing.
#[derive(Debug)]
pub struct BucketOutput {
    /// Path of the temp file holding the finished stream.
    pub path: PathBuf,
    /// SHA-256 of the uncompressed record stream.
    pub hash: Hash256,
    /// Number of records written.
    pub object_count: u64,
    /// Uncompressed stream length in bytes.
    pub byte_size: u64,
}

/// Writes entries to a new bucket file, hashing as it goes.
///
/// The caller is responsible for feeding entries in bucket order
/// (metadata first, then ascending keys); this type does not re-sort.
pub struct BucketOutputIter {
    path: PathBuf,
    encoder: GzEncoder<BufWriter<File>>,
    hasher: Sha256,
    object_count: u64,
    byte_size: u64,
    payload_buf: Vec<u8>,
}

impl BucketOutputIter {
    /// Create a new output file at `path` (a temp-workspace path; the
    /// manager renames it into place once the hash is known).
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            path,
            encoder: GzEncoder::new(BufWriter::new(file), Compression::default()),
            hasher: Sha256::new(),
            object_count: 0,
            byte_size: 0,
            payload_buf: Vec::with_capacity(4096),
        })
    }

    /// Append one entry to the stream.
    pub fn put(&mut self, entry: &BucketEntry) -> Result<()> {
        self.payload_buf.clear();
        entry.encode_payload(&mut self.payload_buf);

        let mark = (self.payload_buf.len() as u32 | RECORD_MARK_FLAG).to_be_bytes();
        self.hasher.update(mark);
        self.hasher.update(&self.payload_buf);
        self.encoder.write_all(&mark)?;
        self.encoder.write_all(&self.payload_buf)?;

        self.object_count += 1;
        self.byte_size += 4 + self.payload_buf.len() as u64;
        Ok(())
    }

    /// Number of records written so far.
    pub fn object_count(&self) -> u64 {
        self.object_count
    }

    /// Flush and close the stream.
    ///
    /// Returns `None` (and removes the file) if nothing was written: a
    /// merge that produced no records yields the canonical empty bucket,
    /// which has no backing file.
    pub fn finish(self) -> Result<Option<BucketOutput>> {
        let writer = self.encoder.finish()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        if self.object_count == 0 {
            std::fs::remove_file(&self.path)?;
            return Ok(None);
        }

        Ok(Some(BucketOutput {
            path: self.path,
            hash: Hash256::from_digest(self.hasher),
            object_count: self.object_count,
            byte_size: self.byte_size,
        }))
    }
}

/// Identity and counts of an existing bucket file.
#[derive(Debug, Clone, Copy)]
pub struct FileScan {
    /// SHA-256 of the uncompressed record stream.
    pub hash: Hash256,
    /// Number of records in the file.
    pub object_count: u64,
    /// Uncompressed stream length in bytes.
    pub byte_size: u64,
}

/// Stream through a bucket file, re-deriving its hash and counts.
///
/// Every record is decoded, so a file that scans clean is also known to
/// be well-formed.
pub fn scan_bucket_file(path: &Path) -> Result<FileScan> {
    let file = File::open(path)?;
    let mut reader = GzDecoder::new(BufReader::new(file));

    let mut hasher = Sha256::new();
    let mut object_count = 0u64;
    let mut byte_size = 0u64;

    while let Some(payload) = read_record(&mut reader)? {
        BucketEntry::decode_payload(&payload)?;
        let mark = (payload.len() as u32 | RECORD_MARK_FLAG).to_be_bytes();
        hasher.update(mark);
        hasher.update(&payload);
        object_count += 1;
        byte_size += 4 + payload.len() as u64;
    }

    Ok(FileScan {
        hash: Hash256::from_digest(hasher),
        object_count,
        byte_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{BucketMetadata, EntryKey, LedgerEntry};
    use tempfile::TempDir;

    fn make_live(seed: u8) -> BucketEntry {
        BucketEntry::Live(LedgerEntry::new(vec![seed; 4], vec![seed; 16]))
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bucket.tmp");

        let entries = vec![
            BucketEntry::Metadata(BucketMetadata {
                protocol_version: 5,
            }),
            make_live(1),
            BucketEntry::Dead(EntryKey::new(vec![2u8; 4])),
            make_live(3),
        ];

        let mut writer = BucketOutputIter::create(path.clone()).unwrap();
        for entry in &entries {
            writer.put(entry).unwrap();
        }
        let output = writer.finish().unwrap().unwrap();
        assert_eq!(output.object_count, 4);

        let mut iter = BucketInputIter::open(&path).unwrap();
        let mut read_back = Vec::new();
        while let Some(entry) = iter.next_entry().unwrap() {
            read_back.push(entry);
        }
        assert_eq!(read_back, entries);
        assert_eq!(iter.bytes_read(), output.byte_size);
    }

    #[test]
    fn test_scan_matches_writer_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bucket.tmp");

        let mut writer = BucketOutputIter::create(path.clone()).unwrap();
        writer.put(&make_live(1)).unwrap();
        writer.put(&make_live(2)).unwrap();
        let output = writer.finish().unwrap().unwrap();

        let scan = scan_bucket_file(&path).unwrap();
        assert_eq!(scan.hash, output.hash);
        assert_eq!(scan.object_count, 2);
        assert_eq!(scan.byte_size, output.byte_size);
    }

    #[test]
    fn test_empty_output_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bucket.tmp");

        let writer = BucketOutputIter::create(path.clone()).unwrap();
        assert!(writer.finish().unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_empty_input_iter() {
        let mut iter = BucketInputIter::empty();
        assert!(iter.next_entry().unwrap().is_none());
        assert_eq!(iter.bytes_read(), 0);
    }

    #[test]
    fn test_identical_entries_identical_hash() {
        let dir = TempDir::new().unwrap();

        let write = |name: &str| {
            let path = dir.path().join(name);
            let mut writer = BucketOutputIter::create(path).unwrap();
            writer.put(&make_live(7)).unwrap();
            writer.finish().unwrap().unwrap()
        };

        let a = write("a.tmp");
        let b = write("b.tmp");
        assert_eq!(a.hash, b.hash);
    }
}
