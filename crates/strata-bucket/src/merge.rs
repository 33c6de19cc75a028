//! Streaming bucket merge.
//!
//! Merging is the operation that maintains bucket-list integrity: two
//! sorted buckets (an older and a newer) are combined into one new
//! bucket, with entries from the newer input shadowing same-key entries
//! from the older.
//!
//! ```text
//! Old bucket: [A=1, C=3, E=5]
//! New bucket: [B=2, C=30, D=4]
//! Merged:     [A=1, B=2, C=30, D=4, E=5]
//! ```
//!
//! # Lifecycle semantics
//!
//! Under a protocol version that supports lifecycle entries:
//!
//! - `INIT + DEAD` = both annihilated (nothing output)
//! - `DEAD + INIT` = `LIVE` (recreation cancels the tombstone)
//! - `INIT + LIVE` = `INIT` with the new value
//!
//! This keeps tombstones from accumulating for entries created and
//! deleted within the same merge window.
//!
//! # Tombstones
//!
//! `keep_tombstones` controls whether `DEAD` entries survive the merge.
//! It is off only when the merge target has reached the configured
//! tombstone-drop level: below that depth a tombstone may still shadow a
//! live entry somewhere older, and dropping it early would silently
//! resurrect stale state.
//!
//! # Protocol derivation
//!
//! The output bucket's metadata version is the maximum of the input
//! versions, validated against the caller's ceiling. A merge spanning a
//! protocol upgrade therefore runs entirely under the newer protocol's
//! rules.
//!
//! Merges stream: two [`BucketInputIter`]s feed one
//! [`BucketOutputIter`]; nothing is materialized in memory and the
//! output hash is known the moment the last record is written.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::bucket::Bucket;
use crate::entry::{BucketEntry, BucketMetadata};
use crate::iterator::{BucketInputIter, BucketOutput, BucketOutputIter};
use crate::metrics::MergeCounters;
use crate::{BucketError, Result, FIRST_PROTOCOL_SUPPORTING_LIFECYCLE_ENTRIES};

/// Options controlling a single merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    /// Whether `DEAD` entries survive into the output.
    pub keep_tombstones: bool,
    /// Whether `INIT` entries are rewritten as `LIVE` (level crossings
    /// into the tombstone-drop level).
    pub normalize_init: bool,
    /// Maximum protocol version the output may carry; 0 = unconstrained.
    pub protocol_version_ceiling: u32,
}

/// Merge two buckets into a new bucket file at `output_path`.
///
/// `new` contains the chronologically newer entries and shadows `old`.
/// Returns `None` when the merge produces the canonical empty bucket
/// (no file is left behind). On error the partially written output is
/// removed; no partial bucket ever survives.
pub fn merge_buckets(
    old: &Bucket,
    new: &Bucket,
    options: &MergeOptions,
    output_path: PathBuf,
    counters: &MergeCounters,
) -> Result<Option<BucketOutput>> {
    // Only the both-empty case is shortcut. A merge with one empty input
    // still streams, because the output carries fresh metadata and hence
    // a different hash than the non-empty input.
    if old.is_empty() && new.is_empty() {
        counters.empty_merge_shortcuts.fetch_add(1, Ordering::Relaxed);
        return Ok(None);
    }

    let started = Instant::now();
    let result = run_merge(old, new, options, output_path.clone(), counters);

    match result {
        Ok(output) => {
            counters.record_merge_completed(started.elapsed().as_micros() as u64);
            Ok(output)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&output_path);
            Err(e)
        }
    }
}

fn run_merge(
    old: &Bucket,
    new: &Bucket,
    options: &MergeOptions,
    output_path: PathBuf,
    counters: &MergeCounters,
) -> Result<Option<BucketOutput>> {
    let mut old_iter = old.iter()?;
    let mut new_iter = new.iter()?;

    tracing::trace!(
        old_hash = %old.hash(),
        new_hash = %new.hash(),
        keep_tombstones = options.keep_tombstones,
        normalize_init = options.normalize_init,
        "merge starting"
    );

    // The metadata record, when present, is always the first record.
    let (old_meta, mut old_cur) = first_entry(&mut old_iter)?;
    let (new_meta, mut new_cur) = first_entry(&mut new_iter)?;

    let output_meta = build_output_metadata(
        old_meta.as_ref(),
        new_meta.as_ref(),
        options.protocol_version_ceiling,
    )?;

    if output_meta.is_some() {
        counters
            .post_lifecycle_protocol_merges
            .fetch_add(1, Ordering::Relaxed);
    } else {
        counters
            .pre_lifecycle_protocol_merges
            .fetch_add(1, Ordering::Relaxed);
    }

    let mut writer = BucketOutputIter::create(output_path)?;

    if let Some(meta) = output_meta {
        emit(&mut writer, BucketEntry::Metadata(meta), counters)?;
    }

    loop {
        // Decide which side advances before touching either slot.
        let ordering = match (old_cur.as_ref(), new_cur.as_ref()) {
            (None, None) => break,
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(old_entry), Some(new_entry)) => {
                // Keyed records only past the metadata prefix.
                let old_key = old_entry.key().ok_or_else(stray_metadata)?;
                let new_key = new_entry.key().ok_or_else(stray_metadata)?;
                old_key.cmp(new_key)
            }
        };

        match ordering {
            std::cmp::Ordering::Less => {
                // Old entry unshadowed. It already crossed a level
                // boundary once, so it is never re-normalized here.
                let entry = old_cur.take().ok_or_else(merge_cursor_desync)?;
                if should_keep_entry(&entry, options.keep_tombstones, counters) {
                    emit(&mut writer, entry, counters)?;
                }
                old_cur = next_keyed(&mut old_iter)?;
            }
            std::cmp::Ordering::Greater => {
                let entry = new_cur.take().ok_or_else(merge_cursor_desync)?;
                if should_keep_entry(&entry, options.keep_tombstones, counters) {
                    emit(
                        &mut writer,
                        maybe_normalize_entry(entry, options.normalize_init),
                        counters,
                    )?;
                }
                new_cur = next_keyed(&mut new_iter)?;
            }
            std::cmp::Ordering::Equal => {
                let old_entry = old_cur.take().ok_or_else(merge_cursor_desync)?;
                let new_entry = new_cur.take().ok_or_else(merge_cursor_desync)?;
                counters.old_entries_shadowed.fetch_add(1, Ordering::Relaxed);
                if let Some(merged) = merge_entries(&old_entry, &new_entry, options, counters) {
                    emit(&mut writer, merged, counters)?;
                }
                old_cur = next_keyed(&mut old_iter)?;
                new_cur = next_keyed(&mut new_iter)?;
            }
        }
    }

    counters
        .entries_read
        .fetch_add(old_iter.entries_read() + new_iter.entries_read(), Ordering::Relaxed);
    counters
        .bytes_read
        .fetch_add(old_iter.bytes_read() + new_iter.bytes_read(), Ordering::Relaxed);

    let output = writer.finish()?;
    if let Some(ref out) = output {
        counters.bytes_written.fetch_add(out.byte_size, Ordering::Relaxed);
        tracing::trace!(
            result_hash = %out.hash,
            result_entries = out.object_count,
            "merge complete"
        );
    }
    Ok(output)
}

/// Pull the first record, separating a leading metadata record from the
/// first keyed entry.
fn first_entry(iter: &mut BucketInputIter) -> Result<(Option<BucketMetadata>, Option<BucketEntry>)> {
    match iter.next_entry()? {
        Some(BucketEntry::Metadata(meta)) => Ok((Some(meta), iter.next_entry()?)),
        other => Ok((None, other)),
    }
}

/// Pull the next keyed record, skipping any stray metadata records.
fn next_keyed(iter: &mut BucketInputIter) -> Result<Option<BucketEntry>> {
    loop {
        match iter.next_entry()? {
            Some(entry) if entry.is_metadata() => continue,
            other => return Ok(other),
        }
    }
}

fn stray_metadata() -> BucketError {
    BucketError::Serialization("metadata record past the head of a bucket".to_string())
}

fn merge_cursor_desync() -> BucketError {
    BucketError::Merge("merge cursor advanced past its input".to_string())
}

fn emit(
    writer: &mut BucketOutputIter,
    entry: BucketEntry,
    counters: &MergeCounters,
) -> Result<()> {
    let counter = match &entry {
        BucketEntry::Metadata(_) => &counters.new_meta_entries,
        BucketEntry::Init(_) => &counters.new_init_entries,
        BucketEntry::Live(_) => &counters.new_live_entries,
        BucketEntry::Dead(_) => &counters.new_dead_entries,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    writer.put(&entry)
}

/// Check whether an entry survives into the merged output.
fn should_keep_entry(
    entry: &BucketEntry,
    keep_tombstones: bool,
    counters: &MergeCounters,
) -> bool {
    if entry.is_dead() && !keep_tombstones {
        counters.tombstones_dropped.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    true
}

/// Conditionally rewrite INIT as LIVE for a level crossing.
fn maybe_normalize_entry(entry: BucketEntry, normalize: bool) -> BucketEntry {
    match entry {
        BucketEntry::Init(e) if normalize => BucketEntry::Live(e),
        other => other,
    }
}

/// Merge two same-key entries.
///
/// Returns the surviving entry, or `None` when the pair annihilates or
/// the tombstone is being dropped.
pub(crate) fn merge_entries(
    old: &BucketEntry,
    new: &BucketEntry,
    options: &MergeOptions,
    counters: &MergeCounters,
) -> Option<BucketEntry> {
    match (old, new) {
        // An entry created and destroyed within the same merge window
        // never needs to be shipped downstream.
        (BucketEntry::Init(_), BucketEntry::Dead(_)) => {
            counters.entries_annihilated.fetch_add(1, Ordering::Relaxed);
            None
        }

        // The old tombstone is cancelled by the recreation.
        (BucketEntry::Dead(_), BucketEntry::Init(entry)) => {
            Some(BucketEntry::Live(entry.clone()))
        }

        // The entry was created in this merge range; keep INIT status
        // with the newer value.
        (BucketEntry::Init(_), BucketEntry::Live(entry)) => Some(BucketEntry::Init(entry.clone())),

        (BucketEntry::Live(_), BucketEntry::Live(entry))
        | (BucketEntry::Dead(_), BucketEntry::Live(entry)) => {
            Some(BucketEntry::Live(entry.clone()))
        }

        (_, BucketEntry::Init(entry)) => {
            if options.normalize_init {
                Some(BucketEntry::Live(entry.clone()))
            } else {
                Some(BucketEntry::Init(entry.clone()))
            }
        }

        (BucketEntry::Live(_), BucketEntry::Dead(key))
        | (BucketEntry::Dead(_), BucketEntry::Dead(key)) => {
            if options.keep_tombstones {
                Some(BucketEntry::Dead(key.clone()))
            } else {
                counters.tombstones_dropped.fetch_add(1, Ordering::Relaxed);
                None
            }
        }

        // Metadata records have no key and never reach collision.
        (BucketEntry::Metadata(_), _) | (_, BucketEntry::Metadata(_)) => None,
    }
}

/// Derive the output metadata record.
///
/// The merge protocol version is the max of the input versions; the
/// ceiling is a constraint on that value, not the output version
/// itself. Output carries metadata only from the first lifecycle
/// protocol onward.
fn build_output_metadata(
    old_meta: Option<&BucketMetadata>,
    new_meta: Option<&BucketMetadata>,
    protocol_version_ceiling: u32,
) -> Result<Option<BucketMetadata>> {
    let mut protocol_version = 0u32;
    if let Some(meta) = old_meta {
        protocol_version = protocol_version.max(meta.protocol_version);
    }
    if let Some(meta) = new_meta {
        protocol_version = protocol_version.max(meta.protocol_version);
    }

    if protocol_version_ceiling > 0 && protocol_version > protocol_version_ceiling {
        return Err(BucketError::Merge(format!(
            "bucket protocol version {protocol_version} exceeds ceiling {protocol_version_ceiling}"
        )));
    }

    if protocol_version >= FIRST_PROTOCOL_SUPPORTING_LIFECYCLE_ENTRIES {
        Ok(Some(BucketMetadata { protocol_version }))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryKey, LedgerEntry};
    use std::path::Path;
    use tempfile::TempDir;

    const TEST_PROTOCOL: u32 = 7;

    fn opts() -> MergeOptions {
        MergeOptions {
            keep_tombstones: true,
            normalize_init: false,
            protocol_version_ceiling: TEST_PROTOCOL,
        }
    }

    fn key(seed: u8) -> EntryKey {
        EntryKey::new(vec![seed; 4])
    }

    fn live(seed: u8, value: &[u8]) -> BucketEntry {
        BucketEntry::Live(LedgerEntry::new(vec![seed; 4], value))
    }

    fn init(seed: u8, value: &[u8]) -> BucketEntry {
        BucketEntry::Init(LedgerEntry::new(vec![seed; 4], value))
    }

    fn dead(seed: u8) -> BucketEntry {
        BucketEntry::Dead(key(seed))
    }

    fn write_bucket(dir: &Path, name: &str, entries: &[BucketEntry]) -> Bucket {
        let path = dir.join(name);
        let mut writer = BucketOutputIter::create(path.clone()).unwrap();
        writer
            .put(&BucketEntry::Metadata(BucketMetadata {
                protocol_version: TEST_PROTOCOL,
            }))
            .unwrap();
        for entry in entries {
            writer.put(entry).unwrap();
        }
        let out = writer.finish().unwrap().unwrap();
        Bucket::from_parts(out.hash, path, out.object_count, out.byte_size)
    }

    fn merge_to(
        dir: &Path,
        old: &Bucket,
        new: &Bucket,
        options: &MergeOptions,
    ) -> (Option<Bucket>, MergeCounters) {
        let counters = MergeCounters::new();
        let out_path = dir.join("merge.out.tmp");
        let output = merge_buckets(old, new, options, out_path.clone(), &counters).unwrap();
        let bucket = output
            .map(|out| Bucket::from_parts(out.hash, out.path, out.object_count, out.byte_size));
        (bucket, counters)
    }

    fn collect(bucket: &Bucket) -> Vec<BucketEntry> {
        let mut iter = bucket.iter().unwrap();
        let mut entries = Vec::new();
        while let Some(entry) = iter.next_entry().unwrap() {
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn test_disjoint_keys_interleave() {
        let dir = TempDir::new().unwrap();
        let old = write_bucket(dir.path(), "old", &[live(1, b"a"), live(3, b"c")]);
        let new = write_bucket(dir.path(), "new", &[live(2, b"b"), live(4, b"d")]);

        let (merged, _) = merge_to(dir.path(), &old, &new, &opts());
        let entries = collect(&merged.unwrap());

        let keys: Vec<u8> = entries
            .iter()
            .filter_map(|e| e.key().map(|k| k.as_bytes()[0]))
            .collect();
        assert_eq!(keys, vec![1, 2, 3, 4]);
        assert!(entries[0].is_metadata());
    }

    #[test]
    fn test_newer_entry_shadows_older() {
        let dir = TempDir::new().unwrap();
        let old = write_bucket(dir.path(), "old", &[live(1, b"old-value")]);
        let new = write_bucket(dir.path(), "new", &[live(1, b"new-value")]);

        let (merged, counters) = merge_to(dir.path(), &old, &new, &opts());
        let merged = merged.unwrap();

        let entry = merged.get(&key(1)).unwrap().unwrap();
        assert_eq!(entry.as_ledger_entry().unwrap().value, b"new-value");
        assert_eq!(counters.snapshot().old_entries_shadowed, 1);
    }

    #[test]
    fn test_init_plus_dead_annihilates() {
        let dir = TempDir::new().unwrap();
        let old = write_bucket(dir.path(), "old", &[init(1, b"created"), live(2, b"kept")]);
        let new = write_bucket(dir.path(), "new", &[dead(1)]);

        let (merged, counters) = merge_to(dir.path(), &old, &new, &opts());
        let merged = merged.unwrap();

        assert!(merged.get(&key(1)).unwrap().is_none());
        assert!(merged.get(&key(2)).unwrap().is_some());
        assert_eq!(counters.snapshot().entries_annihilated, 1);
    }

    #[test]
    fn test_dead_plus_init_recreates_as_live() {
        let dir = TempDir::new().unwrap();
        let old = write_bucket(dir.path(), "old", &[dead(1)]);
        let new = write_bucket(dir.path(), "new", &[init(1, b"reborn")]);

        let (merged, _) = merge_to(dir.path(), &old, &new, &opts());
        let entry = merged.unwrap().get(&key(1)).unwrap().unwrap();
        assert!(entry.is_live());
        assert_eq!(entry.as_ledger_entry().unwrap().value, b"reborn");
    }

    #[test]
    fn test_init_plus_live_stays_init() {
        let dir = TempDir::new().unwrap();
        let old = write_bucket(dir.path(), "old", &[init(1, b"v1")]);
        let new = write_bucket(dir.path(), "new", &[live(1, b"v2")]);

        let (merged, _) = merge_to(dir.path(), &old, &new, &opts());
        let entry = merged.unwrap().get(&key(1)).unwrap().unwrap();
        assert!(entry.is_init());
        assert_eq!(entry.as_ledger_entry().unwrap().value, b"v2");
    }

    #[test]
    fn test_tombstones_dropped_when_not_kept() {
        let dir = TempDir::new().unwrap();
        let old = write_bucket(dir.path(), "old", &[live(1, b"doomed")]);
        let new = write_bucket(dir.path(), "new", &[dead(1), dead(2)]);

        let options = MergeOptions {
            keep_tombstones: false,
            normalize_init: true,
            protocol_version_ceiling: TEST_PROTOCOL,
        };
        let (merged, counters) = merge_to(dir.path(), &old, &new, &options);

        // Only the metadata record remains.
        let entries = collect(&merged.unwrap());
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_metadata());
        assert_eq!(counters.snapshot().tombstones_dropped, 2);
    }

    #[test]
    fn test_tombstone_retained_when_kept() {
        let dir = TempDir::new().unwrap();
        let old = write_bucket(dir.path(), "old", &[live(1, b"v")]);
        let new = write_bucket(dir.path(), "new", &[dead(1)]);

        let (merged, _) = merge_to(dir.path(), &old, &new, &opts());
        let entry = merged.unwrap().get(&key(1)).unwrap().unwrap();
        assert!(entry.is_dead());
    }

    #[test]
    fn test_normalize_init_on_level_crossing() {
        let dir = TempDir::new().unwrap();
        let old = write_bucket(dir.path(), "old", &[]);
        let new = write_bucket(dir.path(), "new", &[init(1, b"v")]);

        let options = MergeOptions {
            keep_tombstones: false,
            normalize_init: true,
            protocol_version_ceiling: TEST_PROTOCOL,
        };
        let (merged, _) = merge_to(dir.path(), &old, &new, &options);
        let entry = merged.unwrap().get(&key(1)).unwrap().unwrap();
        assert!(entry.is_live());
    }

    #[test]
    fn test_both_empty_shortcut() {
        let dir = TempDir::new().unwrap();
        let (merged, counters) = merge_to(dir.path(), &Bucket::empty(), &Bucket::empty(), &opts());
        assert!(merged.is_none());
        assert_eq!(counters.snapshot().empty_merge_shortcuts, 1);
        assert_eq!(counters.snapshot().merges_completed, 0);
    }

    #[test]
    fn test_protocol_ceiling_enforced() {
        let dir = TempDir::new().unwrap();
        let old = write_bucket(dir.path(), "old", &[live(1, b"v")]);
        let new = write_bucket(dir.path(), "new", &[live(2, b"w")]);

        let counters = MergeCounters::new();
        let out_path = dir.path().join("merge.out.tmp");
        let options = MergeOptions {
            keep_tombstones: true,
            normalize_init: false,
            protocol_version_ceiling: TEST_PROTOCOL - 1,
        };
        let result = merge_buckets(&old, &new, &options, out_path.clone(), &counters);
        assert!(matches!(result, Err(BucketError::Merge(_))));
        assert!(!out_path.exists());
    }

    #[test]
    fn test_output_protocol_is_max_of_inputs() {
        let dir = TempDir::new().unwrap();

        let write_with_protocol = |name: &str, protocol: u32, entries: &[BucketEntry]| {
            let path = dir.path().join(name);
            let mut writer = BucketOutputIter::create(path.clone()).unwrap();
            writer
                .put(&BucketEntry::Metadata(BucketMetadata {
                    protocol_version: protocol,
                }))
                .unwrap();
            for entry in entries {
                writer.put(entry).unwrap();
            }
            let out = writer.finish().unwrap().unwrap();
            Bucket::from_parts(out.hash, path, out.object_count, out.byte_size)
        };

        let old = write_with_protocol("old", 5, &[live(1, b"v")]);
        let new = write_with_protocol("new", 6, &[live(2, b"w")]);

        let (merged, _) = merge_to(dir.path(), &old, &new, &opts());
        assert_eq!(merged.unwrap().protocol_version().unwrap(), Some(6));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let old = write_bucket(dir.path(), "old", &[live(1, b"a"), dead(2), init(3, b"c")]);
        let new = write_bucket(dir.path(), "new", &[live(2, b"b"), dead(3)]);

        let counters = MergeCounters::new();
        let run = |n: u32| {
            let out_path = dir.path().join(format!("merge{n}.tmp"));
            merge_buckets(&old, &new, &opts(), out_path, &counters)
                .unwrap()
                .unwrap()
        };
        let first = run(1);
        let second = run(2);
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.byte_size, second.byte_size);

        let bytes_a = std::fs::read(&first.path).unwrap();
        let bytes_b = std::fs::read(&second.path).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }
}
