//! Bucket entry types and the framed binary codec.
//!
//! Entries stored in buckets are opaque key/value records wrapped with a
//! lifecycle tag that controls merge semantics:
//!
//! | Type       | Description                                   | Merge behavior              |
//! |------------|-----------------------------------------------|-----------------------------|
//! | `Live`     | Current state of a key                        | Newer shadows older         |
//! | `Dead`     | Tombstone marking deletion                    | Shadows any older entry     |
//! | `Init`     | Entry created within the merge window         | Annihilates with `Dead`     |
//! | `Metadata` | Bucket metadata (protocol version)            | Merged by taking max version|
//!
//! # Key ordering
//!
//! Keys are opaque byte strings ordered lexicographically. Entries in a
//! bucket file are sorted by key, with the metadata record (which has no
//! key) first. This ordering is what makes streaming merges and bucket
//! hashes deterministic across nodes; it must never change.
//!
//! # Wire format
//!
//! Each record in a bucket file is preceded by a 4-byte big-endian
//! record mark: the payload length with the high bit set. The payload is
//! a 1-byte lifecycle tag followed by length-prefixed fields:
//!
//! ```text
//! LIVE / INIT:  tag, u32 key_len, key bytes, u32 value_len, value bytes
//! DEAD:         tag, u32 key_len, key bytes
//! METADATA:     tag, u32 protocol_version
//! ```
//!
//! The bucket hash is the SHA-256 of the uncompressed record stream,
//! marks included.

use std::cmp::Ordering;

use crate::{BucketError, Result};

/// Lifecycle tag values as stored on disk.
const TAG_LIVE: u8 = 0;
const TAG_INIT: u8 = 1;
const TAG_DEAD: u8 = 2;
const TAG_METADATA: u8 = 3;

/// An opaque, totally ordered key identifying a ledger entry.
///
/// The engine never interprets key contents; ordering is byte-wise
/// lexicographic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryKey(pub Vec<u8>);

impl EntryKey {
    /// Create a key from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for EntryKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for EntryKey {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// An opaque ledger entry: a key plus an uninterpreted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// The entry's key.
    pub key: EntryKey,
    /// The entry's payload. Never interpreted by this crate.
    pub value: Vec<u8>,
}

impl LedgerEntry {
    /// Create an entry from key and value bytes.
    pub fn new(key: impl Into<EntryKey>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Bucket metadata record.
///
/// Present as the first record of every non-empty bucket produced under
/// a protocol version that supports lifecycle entries. The version
/// recorded here is what merges consult to decide which lifecycle rules
/// govern the bucket's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketMetadata {
    /// Protocol version the bucket's contents were produced under.
    pub protocol_version: u32,
}

/// An entry stored in a bucket.
///
/// # Lifecycle merge semantics
///
/// | Old entry | New entry | Result                          |
/// |-----------|-----------|---------------------------------|
/// | `Init`    | `Dead`    | Nothing (both annihilated)      |
/// | `Dead`    | `Init`    | `Live` (recreation)             |
/// | `Init`    | `Live`    | `Init` with new value           |
/// | `Live`    | `Dead`    | `Dead` (if keeping tombstones)  |
/// | `Live`    | `Live`    | Newer `Live` wins               |
///
/// The `Init` tag marks entries created within a merge window so that a
/// subsequent deletion annihilates cleanly instead of leaving a
/// tombstone that must ride the list forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEntry {
    /// A live entry (the current state of this key).
    Live(LedgerEntry),
    /// A tombstone marking that this key has been deleted.
    Dead(EntryKey),
    /// An entry first created within the current merge window.
    Init(LedgerEntry),
    /// Bucket metadata (protocol version).
    Metadata(BucketMetadata),
}

impl BucketEntry {
    /// Get the key for this entry. Metadata records have no key.
    pub fn key(&self) -> Option<&EntryKey> {
        match self {
            BucketEntry::Live(entry) | BucketEntry::Init(entry) => Some(&entry.key),
            BucketEntry::Dead(key) => Some(key),
            BucketEntry::Metadata(_) => None,
        }
    }

    /// Check if this entry is a metadata record.
    pub fn is_metadata(&self) -> bool {
        matches!(self, BucketEntry::Metadata(_))
    }

    /// Check if this is a dead entry (tombstone).
    pub fn is_dead(&self) -> bool {
        matches!(self, BucketEntry::Dead(_))
    }

    /// Check if this is a live entry.
    pub fn is_live(&self) -> bool {
        matches!(self, BucketEntry::Live(_))
    }

    /// Check if this is an init entry.
    pub fn is_init(&self) -> bool {
        matches!(self, BucketEntry::Init(_))
    }

    /// Get the ledger entry if this is a live or init entry.
    pub fn as_ledger_entry(&self) -> Option<&LedgerEntry> {
        match self {
            BucketEntry::Live(entry) | BucketEntry::Init(entry) => Some(entry),
            _ => None,
        }
    }

    /// Encode this entry's payload (tag + fields, no record mark) into `buf`.
    pub fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            BucketEntry::Live(entry) => {
                buf.push(TAG_LIVE);
                encode_bytes(buf, entry.key.as_bytes());
                encode_bytes(buf, &entry.value);
            }
            BucketEntry::Init(entry) => {
                buf.push(TAG_INIT);
                encode_bytes(buf, entry.key.as_bytes());
                encode_bytes(buf, &entry.value);
            }
            BucketEntry::Dead(key) => {
                buf.push(TAG_DEAD);
                encode_bytes(buf, key.as_bytes());
            }
            BucketEntry::Metadata(meta) => {
                buf.push(TAG_METADATA);
                buf.extend_from_slice(&meta.protocol_version.to_be_bytes());
            }
        }
    }

    /// Decode an entry from a record payload (tag + fields, no record mark).
    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        let (&tag, rest) = payload
            .split_first()
            .ok_or_else(|| BucketError::Serialization("empty record payload".to_string()))?;

        match tag {
            TAG_LIVE | TAG_INIT => {
                let (key, rest) = decode_bytes(rest)?;
                let (value, rest) = decode_bytes(rest)?;
                expect_consumed(rest)?;
                let entry = LedgerEntry::new(key, value);
                Ok(if tag == TAG_LIVE {
                    BucketEntry::Live(entry)
                } else {
                    BucketEntry::Init(entry)
                })
            }
            TAG_DEAD => {
                let (key, rest) = decode_bytes(rest)?;
                expect_consumed(rest)?;
                Ok(BucketEntry::Dead(EntryKey::new(key)))
            }
            TAG_METADATA => {
                let raw: [u8; 4] = rest.try_into().map_err(|_| {
                    BucketError::Serialization("truncated metadata record".to_string())
                })?;
                Ok(BucketEntry::Metadata(BucketMetadata {
                    protocol_version: u32::from_be_bytes(raw),
                }))
            }
            other => Err(BucketError::Serialization(format!(
                "unknown bucket entry tag {other}"
            ))),
        }
    }
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn decode_bytes(input: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    if input.len() < 4 {
        return Err(BucketError::Serialization(
            "truncated length prefix".to_string(),
        ));
    }
    let (len_bytes, rest) = input.split_at(4);
    let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    if rest.len() < len {
        return Err(BucketError::Serialization(format!(
            "field length {} exceeds remaining payload {}",
            len,
            rest.len()
        )));
    }
    let (field, rest) = rest.split_at(len);
    Ok((field.to_vec(), rest))
}

fn expect_consumed(rest: &[u8]) -> Result<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(BucketError::Serialization(format!(
            "{} trailing bytes after record payload",
            rest.len()
        )))
    }
}

/// Compare two bucket entries for file ordering.
///
/// The metadata record sorts before every keyed record; keyed records
/// order by key bytes. This must match the order merges emit, or bucket
/// hashes diverge between nodes.
pub fn compare_entries(a: &BucketEntry, b: &BucketEntry) -> Ordering {
    match (a.key(), b.key()) {
        (Some(key_a), Some(key_b)) => key_a.cmp(key_b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
