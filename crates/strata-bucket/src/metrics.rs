//! Merge statistics.
//!
//! [`MergeCounters`] is an accumulating record of merge work: entries
//! and bytes moved, lifecycle shortcuts taken, and wall time spent.
//! Counters inform operators and tests; no correctness decision ever
//! reads them.
//!
//! The counters are an explicitly passed, injectable accumulator rather
//! than ambient global state, so independent bucket lists (and tests)
//! never cross-contaminate counts.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for bucket merge operations.
///
/// All fields are atomics updated with relaxed ordering; reads are
/// snapshot-consistent only when taken under the manager's lock.
#[derive(Debug, Default)]
pub struct MergeCounters {
    /// Entries consumed from merge inputs.
    pub entries_read: AtomicU64,
    /// Uncompressed bytes consumed from merge inputs.
    pub bytes_read: AtomicU64,
    /// Uncompressed bytes written to merge outputs.
    pub bytes_written: AtomicU64,
    /// Metadata records written.
    pub new_meta_entries: AtomicU64,
    /// Init entries written.
    pub new_init_entries: AtomicU64,
    /// Live entries written.
    pub new_live_entries: AtomicU64,
    /// Dead entries written.
    pub new_dead_entries: AtomicU64,
    /// Old entries shadowed by newer same-key entries.
    pub old_entries_shadowed: AtomicU64,
    /// Init+Dead pairs annihilated.
    pub entries_annihilated: AtomicU64,
    /// Tombstones dropped at the tombstone-drop level.
    pub tombstones_dropped: AtomicU64,
    /// Merges short-circuited because both inputs were empty.
    pub empty_merge_shortcuts: AtomicU64,
    /// Merge outputs that were already interned (dedup hits).
    pub output_reuses: AtomicU64,
    /// Merges whose inputs predate lifecycle-entry support.
    pub pre_lifecycle_protocol_merges: AtomicU64,
    /// Merges run under lifecycle-entry rules.
    pub post_lifecycle_protocol_merges: AtomicU64,
    /// Merges completed.
    pub merges_completed: AtomicU64,
    /// Total merge time in microseconds.
    pub merge_time_us: AtomicU64,
}

impl MergeCounters {
    /// Creates zeroed merge counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed merge and its duration.
    pub fn record_merge_completed(&self, duration_us: u64) {
        self.merges_completed.fetch_add(1, Ordering::Relaxed);
        self.merge_time_us.fetch_add(duration_us, Ordering::Relaxed);
    }

    /// Returns a non-atomic copy of the counters.
    pub fn snapshot(&self) -> MergeCountersSnapshot {
        MergeCountersSnapshot {
            entries_read: self.entries_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            new_meta_entries: self.new_meta_entries.load(Ordering::Relaxed),
            new_init_entries: self.new_init_entries.load(Ordering::Relaxed),
            new_live_entries: self.new_live_entries.load(Ordering::Relaxed),
            new_dead_entries: self.new_dead_entries.load(Ordering::Relaxed),
            old_entries_shadowed: self.old_entries_shadowed.load(Ordering::Relaxed),
            entries_annihilated: self.entries_annihilated.load(Ordering::Relaxed),
            tombstones_dropped: self.tombstones_dropped.load(Ordering::Relaxed),
            empty_merge_shortcuts: self.empty_merge_shortcuts.load(Ordering::Relaxed),
            output_reuses: self.output_reuses.load(Ordering::Relaxed),
            pre_lifecycle_protocol_merges: self
                .pre_lifecycle_protocol_merges
                .load(Ordering::Relaxed),
            post_lifecycle_protocol_merges: self
                .post_lifecycle_protocol_merges
                .load(Ordering::Relaxed),
            merges_completed: self.merges_completed.load(Ordering::Relaxed),
            merge_time_us: self.merge_time_us.load(Ordering::Relaxed),
        }
    }

    /// Accumulate a snapshot into these counters.
    pub fn combine(&self, delta: &MergeCountersSnapshot) {
        self.entries_read
            .fetch_add(delta.entries_read, Ordering::Relaxed);
        self.bytes_read.fetch_add(delta.bytes_read, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(delta.bytes_written, Ordering::Relaxed);
        self.new_meta_entries
            .fetch_add(delta.new_meta_entries, Ordering::Relaxed);
        self.new_init_entries
            .fetch_add(delta.new_init_entries, Ordering::Relaxed);
        self.new_live_entries
            .fetch_add(delta.new_live_entries, Ordering::Relaxed);
        self.new_dead_entries
            .fetch_add(delta.new_dead_entries, Ordering::Relaxed);
        self.old_entries_shadowed
            .fetch_add(delta.old_entries_shadowed, Ordering::Relaxed);
        self.entries_annihilated
            .fetch_add(delta.entries_annihilated, Ordering::Relaxed);
        self.tombstones_dropped
            .fetch_add(delta.tombstones_dropped, Ordering::Relaxed);
        self.empty_merge_shortcuts
            .fetch_add(delta.empty_merge_shortcuts, Ordering::Relaxed);
        self.output_reuses
            .fetch_add(delta.output_reuses, Ordering::Relaxed);
        self.pre_lifecycle_protocol_merges
            .fetch_add(delta.pre_lifecycle_protocol_merges, Ordering::Relaxed);
        self.post_lifecycle_protocol_merges
            .fetch_add(delta.post_lifecycle_protocol_merges, Ordering::Relaxed);
        self.merges_completed
            .fetch_add(delta.merges_completed, Ordering::Relaxed);
        self.merge_time_us
            .fetch_add(delta.merge_time_us, Ordering::Relaxed);
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        self.entries_read.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.new_meta_entries.store(0, Ordering::Relaxed);
        self.new_init_entries.store(0, Ordering::Relaxed);
        self.new_live_entries.store(0, Ordering::Relaxed);
        self.new_dead_entries.store(0, Ordering::Relaxed);
        self.old_entries_shadowed.store(0, Ordering::Relaxed);
        self.entries_annihilated.store(0, Ordering::Relaxed);
        self.tombstones_dropped.store(0, Ordering::Relaxed);
        self.empty_merge_shortcuts.store(0, Ordering::Relaxed);
        self.output_reuses.store(0, Ordering::Relaxed);
        self.pre_lifecycle_protocol_merges.store(0, Ordering::Relaxed);
        self.post_lifecycle_protocol_merges.store(0, Ordering::Relaxed);
        self.merges_completed.store(0, Ordering::Relaxed);
        self.merge_time_us.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of merge counters (non-atomic copy).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCountersSnapshot {
    pub entries_read: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub new_meta_entries: u64,
    pub new_init_entries: u64,
    pub new_live_entries: u64,
    pub new_dead_entries: u64,
    pub old_entries_shadowed: u64,
    pub entries_annihilated: u64,
    pub tombstones_dropped: u64,
    pub empty_merge_shortcuts: u64,
    pub output_reuses: u64,
    pub pre_lifecycle_protocol_merges: u64,
    pub post_lifecycle_protocol_merges: u64,
    pub merges_completed: u64,
    pub merge_time_us: u64,
}

impl MergeCountersSnapshot {
    /// Total entries written across all record types.
    pub fn total_entries_written(&self) -> u64 {
        self.new_meta_entries + self.new_init_entries + self.new_live_entries + self.new_dead_entries
    }

    /// Average merge time in microseconds.
    pub fn avg_merge_time_us(&self) -> f64 {
        if self.merges_completed == 0 {
            0.0
        } else {
            self.merge_time_us as f64 / self.merges_completed as f64
        }
    }
}
