//! Bucket list implementation for strata.
//!
//! The bucket list is the authenticated representation of the ledger's
//! full state: a log-structured merge structure of immutable,
//! content-addressed files whose merge schedule, hash derivation, and
//! garbage collection are bit-exact across independent nodes. Two nodes
//! fed the same ledger closes produce byte-identical bucket files and
//! the same aggregate hash; that determinism is the property every
//! design choice in this crate protects.
//!
//! # Structure
//!
//! The bucket list has [`BUCKET_LIST_LEVELS`] levels, each holding two
//! buckets:
//!
//! - `curr`: the bucket currently receiving merges
//! - `snap`: the snapshot frozen at the level's last spill
//!
//! Lower levels hold recent entries and update frequently; deeper
//! levels hold older data and update rarely, on the skip-value schedule
//! in [`LEVEL_SKIP_VALUES`].
//!
//! # Entry lifecycle
//!
//! Entries are opaque key/value records tagged with one of:
//!
//! - [`BucketEntry::Init`]: first appearance of a key
//! - [`BucketEntry::Live`]: an update
//! - [`BucketEntry::Dead`]: a tombstone
//! - [`BucketEntry::Metadata`]: bucket metadata (protocol version)
//!
//! Merge semantics for same-key collisions:
//!
//! - `INIT + DEAD` = both annihilated (nothing output)
//! - `DEAD + INIT` = `LIVE` (recreation cancels the tombstone)
//! - `INIT + LIVE` = `INIT` with the new value
//! - `LIVE + DEAD` = `DEAD` (deletion shadows the old value)
//!
//! # Ownership
//!
//! Buckets are immutable and shared: the [`BucketManager`] interns every
//! bucket by hash, level slots hold `Arc` references, and the backing
//! file is deleted only when a garbage-collection sweep finds no holder
//! left.
//!
//! # Example
//!
//! ```ignore
//! use strata_bucket::BucketManager;
//!
//! let manager = BucketManager::new("/var/lib/strata/buckets".into())?;
//! manager.initialize()?;
//!
//! // Once per ledger close:
//! manager.add_batch(seq, protocol, init_entries, live_entries, dead_entries)?;
//! manager.snapshot_ledger(&mut header);
//!
//! // Catch-up from an archive manifest:
//! let missing = manager.check_for_missing_buckets_files(&has)?;
//! // ... fetch and adopt the missing files ...
//! manager.assume_state(&has, max_protocol)?;
//! ```

mod archive_state;
mod bucket;
mod bucket_list;
mod entry;
mod error;
mod iterator;
mod manager;
mod merge;
mod metrics;

// ============================================================================
// Core bucket types
// ============================================================================

pub use bucket::Bucket;
pub use bucket_list::{
    BucketLevel, BucketList, BucketListConfig, BUCKET_LIST_LEVELS, LEVEL_SKIP_VALUES,
};

// ============================================================================
// Entry types
// ============================================================================

pub use entry::{compare_entries, BucketEntry, BucketMetadata, EntryKey, LedgerEntry};

// ============================================================================
// Error handling
// ============================================================================

pub use error::BucketError;

// ============================================================================
// Bucket management
// ============================================================================

pub use manager::{BucketManager, BucketStore, BUCKET_FILE_EXTENSION};

// ============================================================================
// Merge operations
// ============================================================================

pub use merge::{merge_buckets, MergeOptions};

// ============================================================================
// Streaming iterators
// ============================================================================

pub use iterator::{scan_bucket_file, BucketInputIter, BucketOutput, BucketOutputIter, FileScan};

// ============================================================================
// Archive manifests
// ============================================================================

pub use archive_state::{
    HasBucketLevel, HasBucketNext, HistoryArchiveState, NEXT_STATE_CLEAR, NEXT_STATE_INPUTS,
    NEXT_STATE_OUTPUT,
};

// ============================================================================
// Metrics and counters
// ============================================================================

pub use metrics::{MergeCounters, MergeCountersSnapshot};

// ============================================================================
// Protocol version constants
// ============================================================================

/// First protocol version supporting INIT and METADATA records.
///
/// Batches closed under earlier protocols write plain LIVE/DEAD records
/// and their buckets carry no metadata record; merges over such buckets
/// run without the lifecycle annihilation rules.
pub const FIRST_PROTOCOL_SUPPORTING_LIFECYCLE_ENTRIES: u32 = 3;

/// Result type for bucket operations.
pub type Result<T> = std::result::Result<T, BucketError>;
