//! The bucket list: the full leveled structure of ledger state.
//!
//! The bucket list is a log-structured merge structure of
//! [`BUCKET_LIST_LEVELS`] levels, each holding two buckets:
//!
//! - `curr`: the bucket currently receiving merges
//! - `snap`: the frozen snapshot from the level's last spill
//!
//! Lower levels hold recent entries and churn quickly; deeper levels
//! hold older, more stable data and churn rarely.
//!
//! # Spill schedule
//!
//! Level *i* spills every `LEVEL_SKIP_VALUES[i]` ledger closes: its
//! `curr` freezes into `snap`, and the new `snap` merges into level
//! *i+1*'s `curr`. The deepest level never spills.
//!
//! | Level | Spill period (ledgers) |
//! |-------|------------------------|
//! | 0     | 50                     |
//! | 1     | 5 000                  |
//! | 2     | 50 000                 |
//! | 3     | 500 000                |
//! | ...   | ×10 per level          |
//!
//! # Staged merges
//!
//! A spill's merge output is staged in the receiving level's `next`
//! slot and promoted to `curr` when that level next receives a spill.
//! When a level's own spill will land before its staged merge is
//! promoted, the merge is prepared against an empty `curr` instead;
//! otherwise the window sitting in `curr` would flow upward through the
//! spill *and* survive inside the staged result, duplicating state.
//!
//! # Hash
//!
//! The aggregate hash is a single SHA-256 over every level's `curr` and
//! `snap` hashes in level order. Any single-bit difference in any
//! bucket anywhere changes the aggregate; this digest is what the
//! network agrees on.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use strata_common::{Hash256, LedgerHeader, SKIP_SLOTS};

use crate::bucket::Bucket;
use crate::entry::{BucketEntry, BucketMetadata, EntryKey, LedgerEntry};
use crate::manager::BucketStore;
use crate::merge::{merge_entries, MergeOptions};
use crate::metrics::MergeCounters;
use crate::{Result, FIRST_PROTOCOL_SUPPORTING_LIFECYCLE_ENTRIES};

/// Number of levels in the bucket list.
pub const BUCKET_LIST_LEVELS: usize = 11;

/// Ledger closes between successive spills at each level.
///
/// The first four values are protocol constants; deeper levels continue
/// the ×10 progression. The deepest level has no skip value because it
/// never spills.
pub const LEVEL_SKIP_VALUES: [u64; BUCKET_LIST_LEVELS - 1] = [
    50,
    5_000,
    50_000,
    500_000,
    5_000_000,
    50_000_000,
    500_000_000,
    5_000_000_000,
    50_000_000_000,
    500_000_000_000,
];

/// Injected bucket-list policy.
#[derive(Debug, Clone, Copy)]
pub struct BucketListConfig {
    /// Level index at which merges drop tombstones.
    ///
    /// A `DEAD` entry that has merged down to this level can no longer
    /// shadow a live entry anywhere older, so retaining it only wastes
    /// space; dropping it any earlier would silently resurrect stale
    /// state. The value is protocol-governed (tied to the network's
    /// entry-eviction horizon) and must match the host network's
    /// configuration exactly.
    pub tombstone_drop_level: usize,
}

impl Default for BucketListConfig {
    fn default() -> Self {
        Self {
            tombstone_drop_level: BUCKET_LIST_LEVELS - 1,
        }
    }
}

/// A single level: `curr`, `snap`, and the staged `next` merge output.
#[derive(Debug, Clone)]
pub struct BucketLevel {
    curr: Arc<Bucket>,
    snap: Arc<Bucket>,
    /// Staged merge result awaiting promotion into `curr`.
    next: Option<Arc<Bucket>>,
    level: usize,
}

impl BucketLevel {
    /// Create an empty level.
    pub fn new(level: usize) -> Self {
        Self {
            curr: Arc::new(Bucket::empty()),
            snap: Arc::new(Bucket::empty()),
            next: None,
            level,
        }
    }

    /// Build a level from resolved buckets (assume-state rehydration).
    pub fn from_buckets(
        level: usize,
        curr: Arc<Bucket>,
        snap: Arc<Bucket>,
        next: Option<Arc<Bucket>>,
    ) -> Self {
        Self {
            curr,
            snap,
            next,
            level,
        }
    }

    /// The bucket currently receiving merges.
    pub fn curr(&self) -> &Arc<Bucket> {
        &self.curr
    }

    /// The frozen snapshot from this level's last spill.
    pub fn snap(&self) -> &Arc<Bucket> {
        &self.snap
    }

    /// The staged merge output, if a spill into this level is pending
    /// promotion.
    pub fn next(&self) -> Option<&Arc<Bucket>> {
        self.next.as_ref()
    }

    /// The level index.
    pub fn level_number(&self) -> usize {
        self.level
    }

    /// Promote the staged merge output into `curr`, if any.
    fn commit(&mut self) {
        if let Some(next) = self.next.take() {
            self.curr = next;
        }
    }

    /// Freeze `curr` into `snap` and reset `curr` to empty.
    ///
    /// Returns the new `snap` (the old `curr`): the bucket that flows
    /// into the next level's merge.
    fn freeze(&mut self) -> Arc<Bucket> {
        self.snap = std::mem::replace(&mut self.curr, Arc::new(Bucket::empty()));
        Arc::clone(&self.snap)
    }
}

/// The complete bucket list representing all ledger state.
#[derive(Debug, Clone)]
pub struct BucketList {
    levels: Vec<BucketLevel>,
    /// Sequence of the last ledger absorbed.
    ledger_seq: u32,
    config: BucketListConfig,
}

impl BucketList {
    /// Number of levels in the bucket list.
    pub const NUM_LEVELS: usize = BUCKET_LIST_LEVELS;

    /// Create an empty bucket list: at genesis every slot holds the
    /// canonical empty bucket.
    pub fn new() -> Self {
        Self::with_config(BucketListConfig::default())
    }

    /// Create an empty bucket list with explicit policy.
    pub fn with_config(config: BucketListConfig) -> Self {
        let levels = (0..BUCKET_LIST_LEVELS).map(BucketLevel::new).collect();
        Self {
            levels,
            ledger_seq: 0,
            config,
        }
    }

    /// Rebuild a bucket list from resolved levels (assume-state).
    pub fn from_levels(
        levels: Vec<BucketLevel>,
        ledger_seq: u32,
        config: BucketListConfig,
    ) -> Result<Self> {
        if levels.len() != BUCKET_LIST_LEVELS {
            return Err(crate::BucketError::Serialization(format!(
                "expected {} bucket levels, got {}",
                BUCKET_LIST_LEVELS,
                levels.len()
            )));
        }
        Ok(Self {
            levels,
            ledger_seq,
            config,
        })
    }

    /// The aggregate bucket-list hash: SHA-256 over every level's
    /// `curr` and `snap` hashes in level order.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        for level in &self.levels {
            hasher.update(level.curr.hash().as_bytes());
            hasher.update(level.snap.hash().as_bytes());
        }
        Hash256::from_digest(hasher)
    }

    /// Sequence of the last ledger absorbed.
    pub fn ledger_seq(&self) -> u32 {
        self.ledger_seq
    }

    /// All levels in order.
    pub fn levels(&self) -> &[BucketLevel] {
        &self.levels
    }

    /// A single level.
    pub fn level(&self, idx: usize) -> Option<&BucketLevel> {
        self.levels.get(idx)
    }

    /// True when a level spills at the given ledger close.
    pub fn level_should_spill(ledger_seq: u32, level: usize) -> bool {
        Self::spills_at(ledger_seq as u64, level)
    }

    fn spills_at(ledger_seq: u64, level: usize) -> bool {
        level < BUCKET_LIST_LEVELS - 1
            && ledger_seq > 0
            && ledger_seq % LEVEL_SKIP_VALUES[level] == 0
    }

    /// Ledgers remaining after `ledger_seq` until the level next spills.
    pub fn ledgers_until_spill(ledger_seq: u32, level: usize) -> u64 {
        let skip = LEVEL_SKIP_VALUES[level];
        skip - (ledger_seq as u64 % skip)
    }

    /// Whether a merge prepared at this close must run against an empty
    /// `curr`.
    ///
    /// The staged merge prepared now is promoted when the level next
    /// receives a spill, one skip-period of the level below from now.
    /// If the level's own spill lands at that same close, its `curr` is
    /// frozen *before* the promotion; a merge that had consumed `curr`
    /// would then duplicate the frozen window.
    pub fn should_merge_with_empty_curr(ledger_seq: u32, level: usize) -> bool {
        if level == 0 {
            return false;
        }
        let next_promotion = ledger_seq as u64 + LEVEL_SKIP_VALUES[level - 1];
        Self::spills_at(next_promotion, level)
    }

    fn keep_tombstones(&self, level: usize) -> bool {
        level < self.config.tombstone_drop_level
    }

    /// Absorb the entry deltas of a newly closed ledger.
    ///
    /// Must be called exactly once per close, in strictly increasing
    /// ledger order; violating the order is a programming error in the
    /// host's close pipeline, not a recoverable condition.
    ///
    /// Given identical inputs and prior state, every node produces
    /// byte-identical buckets and the same aggregate hash; this is the
    /// property everything else here exists to protect.
    #[allow(clippy::too_many_arguments)]
    pub fn add_batch(
        &mut self,
        store: &mut BucketStore,
        counters: &MergeCounters,
        ledger_seq: u32,
        protocol_version: u32,
        init_entries: Vec<LedgerEntry>,
        live_entries: Vec<LedgerEntry>,
        dead_entries: Vec<EntryKey>,
    ) -> Result<()> {
        assert!(
            ledger_seq > self.ledger_seq,
            "add_batch called out of order: ledger {} after {}",
            ledger_seq,
            self.ledger_seq
        );

        let batch = self.build_batch_bucket(
            store,
            counters,
            protocol_version,
            init_entries,
            live_entries,
            dead_entries,
        )?;

        // Process spills from the deepest receiving level down. Each
        // frozen snap flows into the level above it in the loop before
        // that level itself is touched.
        for i in (1..BUCKET_LIST_LEVELS).rev() {
            if Self::level_should_spill(ledger_seq, i - 1) {
                let spilling_snap = self.levels[i - 1].freeze();

                tracing::debug!(
                    ledger_seq,
                    from_level = i - 1,
                    snap_hash = %spilling_snap.hash(),
                    "level spill"
                );

                self.levels[i].commit();

                let keep_tombstones = self.keep_tombstones(i);
                let options = MergeOptions {
                    keep_tombstones,
                    normalize_init: !keep_tombstones,
                    protocol_version_ceiling: protocol_version,
                };
                let curr_for_merge = if Self::should_merge_with_empty_curr(ledger_seq, i) {
                    Arc::new(Bucket::empty())
                } else {
                    Arc::clone(&self.levels[i].curr)
                };

                let merged = store.merge(&curr_for_merge, &spilling_snap, &options, counters)?;
                self.levels[i].next = Some(merged);
            }
        }

        // Level 0 absorbs the batch directly and promotes immediately.
        let options = MergeOptions {
            keep_tombstones: self.keep_tombstones(0),
            normalize_init: false,
            protocol_version_ceiling: protocol_version,
        };
        let curr = Arc::clone(&self.levels[0].curr);
        let merged = store.merge(&curr, &batch, &options, counters)?;
        self.levels[0].next = Some(merged);
        self.levels[0].commit();

        self.ledger_seq = ledger_seq;
        Ok(())
    }

    /// Build the close's batch bucket from the three entry deltas.
    ///
    /// Each delta is unique by key within itself; collisions *across*
    /// deltas (a key created and then deleted within the same close)
    /// are resolved with the same lifecycle table merges use, applied
    /// in chronological order init → live → dead. An INIT+DEAD pair in
    /// one close therefore ships nothing.
    fn build_batch_bucket(
        &self,
        store: &mut BucketStore,
        counters: &MergeCounters,
        protocol_version: u32,
        init_entries: Vec<LedgerEntry>,
        live_entries: Vec<LedgerEntry>,
        dead_entries: Vec<EntryKey>,
    ) -> Result<Arc<Bucket>> {
        if init_entries.is_empty() && live_entries.is_empty() && dead_entries.is_empty() {
            return Ok(Arc::new(Bucket::empty()));
        }

        let use_lifecycle = protocol_version >= FIRST_PROTOCOL_SUPPORTING_LIFECYCLE_ENTRIES;
        let resolve_options = MergeOptions {
            keep_tombstones: true,
            normalize_init: false,
            protocol_version_ceiling: 0,
        };

        let mut resolved: BTreeMap<EntryKey, BucketEntry> = BTreeMap::new();
        let mut apply = |resolved: &mut BTreeMap<EntryKey, BucketEntry>, entry: BucketEntry| {
            let key = entry
                .key()
                .cloned()
                .unwrap_or_else(|| unreachable!("batch entries always carry keys"));
            match resolved.remove(&key) {
                None => {
                    resolved.insert(key, entry);
                }
                Some(prev) => {
                    if let Some(merged) = merge_entries(&prev, &entry, &resolve_options, counters)
                    {
                        resolved.insert(key, merged);
                    }
                }
            }
        };

        for entry in init_entries {
            let entry = if use_lifecycle {
                BucketEntry::Init(entry)
            } else {
                BucketEntry::Live(entry)
            };
            apply(&mut resolved, entry);
        }
        for entry in live_entries {
            apply(&mut resolved, BucketEntry::Live(entry));
        }
        for key in dead_entries {
            apply(&mut resolved, BucketEntry::Dead(key));
        }

        if resolved.is_empty() {
            return Ok(Arc::new(Bucket::empty()));
        }

        let mut entries = Vec::with_capacity(resolved.len() + 1);
        if use_lifecycle {
            entries.push(BucketEntry::Metadata(BucketMetadata { protocol_version }));
        }
        entries.extend(resolved.into_values());

        store.write_bucket(entries, counters)
    }

    /// Look up an entry by key.
    ///
    /// Searches newest to oldest: per level, the staged `next` first
    /// (it holds the youngest data when a merge is pending), then
    /// `curr`, then `snap`. A tombstone shadows everything older.
    pub fn get(&self, key: &EntryKey) -> Result<Option<LedgerEntry>> {
        for level in &self.levels {
            let mut buckets: Vec<&Bucket> = Vec::with_capacity(3);
            if let Some(next) = level.next() {
                buckets.push(next);
            }
            buckets.push(&level.curr);
            buckets.push(&level.snap);

            for bucket in buckets {
                match bucket.get(key)? {
                    Some(BucketEntry::Live(entry)) | Some(BucketEntry::Init(entry)) => {
                        return Ok(Some(entry));
                    }
                    Some(BucketEntry::Dead(_)) => return Ok(None),
                    Some(BucketEntry::Metadata(_)) | None => {}
                }
            }
        }
        Ok(None)
    }

    /// Whether a live entry exists for the key.
    pub fn contains(&self, key: &EntryKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// The net set of live entries across the whole list.
    ///
    /// Streams every bucket newest to oldest; the first occurrence of a
    /// key wins and tombstones suppress older occurrences.
    pub fn live_entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut seen: HashSet<EntryKey> = HashSet::new();
        let mut entries = Vec::new();

        for level in &self.levels {
            let mut buckets: Vec<&Bucket> = Vec::with_capacity(3);
            if let Some(next) = level.next() {
                buckets.push(next);
            }
            buckets.push(&level.curr);
            buckets.push(&level.snap);

            for bucket in buckets {
                let mut iter = bucket.iter()?;
                while let Some(entry) = iter.next_entry()? {
                    match entry {
                        BucketEntry::Live(live) | BucketEntry::Init(live) => {
                            if seen.insert(live.key.clone()) {
                                entries.push(live);
                            }
                        }
                        BucketEntry::Dead(key) => {
                            seen.insert(key);
                        }
                        BucketEntry::Metadata(_) => {}
                    }
                }
            }
        }

        Ok(entries)
    }

    /// Every bucket hash reachable from the level slots, staged merges
    /// included. Input order is curr, snap, next per level.
    pub fn referenced_hashes(&self) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(BUCKET_LIST_LEVELS * 3);
        for level in &self.levels {
            hashes.push(level.curr.hash());
            hashes.push(level.snap.hash());
            if let Some(next) = level.next() {
                hashes.push(next.hash());
            }
        }
        hashes
    }

    /// The `curr`/`snap` hash pairs in level order (manifest surface).
    pub fn level_hashes(&self) -> Vec<(Hash256, Hash256)> {
        self.levels
            .iter()
            .map(|level| (level.curr.hash(), level.snap.hash()))
            .collect()
    }

    /// Stamp the aggregate hash and skip values into the header being
    /// closed. Called once per close, after `add_batch`.
    pub fn snapshot_ledger(&self, header: &mut LedgerHeader) {
        header.bucket_list_hash = self.hash();
        self.calculate_skip_values(header);
    }

    /// Stamp, for the shallowest levels, how many ledgers remain until
    /// each next spill. A consumer of the header can tell from these
    /// whether a level's snap is freshly frozen (merge likely in
    /// flight) or long settled.
    pub fn calculate_skip_values(&self, header: &mut LedgerHeader) {
        for slot in 0..SKIP_SLOTS {
            header.skip_values[slot] = Self::ledgers_until_spill(header.ledger_seq, slot);
        }
    }
}

impl Default for BucketList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::BucketStore;
    use tempfile::TempDir;

    const TEST_PROTOCOL: u32 = 7;

    fn make_store(dir: &TempDir) -> BucketStore {
        BucketStore::new(
            dir.path().join("buckets"),
            dir.path().join("buckets").join("tmp"),
        )
        .unwrap()
    }

    fn seeded_key(seed: u32) -> EntryKey {
        EntryKey::new(seed.to_be_bytes().to_vec())
    }

    fn seeded_entry(seed: u32, value: &[u8]) -> LedgerEntry {
        LedgerEntry::new(seed.to_be_bytes().to_vec(), value)
    }

    fn add_one(
        bl: &mut BucketList,
        store: &mut BucketStore,
        counters: &MergeCounters,
        ledger_seq: u32,
        init: Vec<LedgerEntry>,
        live: Vec<LedgerEntry>,
        dead: Vec<EntryKey>,
    ) {
        bl.add_batch(store, counters, ledger_seq, TEST_PROTOCOL, init, live, dead)
            .unwrap();
    }

    #[test]
    fn test_new_bucket_list_is_empty() {
        let bl = BucketList::new();
        assert_eq!(bl.levels().len(), BUCKET_LIST_LEVELS);
        assert_eq!(bl.ledger_seq(), 0);
        for level in bl.levels() {
            assert!(level.curr().is_empty());
            assert!(level.snap().is_empty());
            assert!(level.next().is_none());
        }
    }

    #[test]
    fn test_add_then_get() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let counters = MergeCounters::new();
        let mut bl = BucketList::new();

        add_one(
            &mut bl,
            &mut store,
            &counters,
            1,
            vec![seeded_entry(1, b"one")],
            vec![],
            vec![],
        );

        let found = bl.get(&seeded_key(1)).unwrap().unwrap();
        assert_eq!(found.value, b"one");
        assert!(bl.get(&seeded_key(2)).unwrap().is_none());
    }

    #[test]
    fn test_update_shadows_older_value() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let counters = MergeCounters::new();
        let mut bl = BucketList::new();

        add_one(
            &mut bl,
            &mut store,
            &counters,
            1,
            vec![seeded_entry(1, b"v1")],
            vec![],
            vec![],
        );
        add_one(
            &mut bl,
            &mut store,
            &counters,
            2,
            vec![],
            vec![seeded_entry(1, b"v2")],
            vec![],
        );

        let found = bl.get(&seeded_key(1)).unwrap().unwrap();
        assert_eq!(found.value, b"v2");
    }

    #[test]
    fn test_delete_shadows_entry() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let counters = MergeCounters::new();
        let mut bl = BucketList::new();

        add_one(
            &mut bl,
            &mut store,
            &counters,
            1,
            vec![seeded_entry(1, b"v")],
            vec![],
            vec![],
        );
        add_one(
            &mut bl,
            &mut store,
            &counters,
            2,
            vec![],
            vec![],
            vec![seeded_key(1)],
        );

        assert!(bl.get(&seeded_key(1)).unwrap().is_none());
        assert!(bl.live_entries().unwrap().is_empty());
    }

    #[test]
    fn test_init_and_dead_in_same_close_ship_nothing() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let counters = MergeCounters::new();
        let mut bl = BucketList::new();

        add_one(
            &mut bl,
            &mut store,
            &counters,
            1,
            vec![seeded_entry(1, b"transient")],
            vec![],
            vec![seeded_key(1)],
        );

        assert!(bl.get(&seeded_key(1)).unwrap().is_none());
        // The pair annihilated during batch resolution: level 0 holds no
        // record of the key at all.
        assert_eq!(counters.snapshot().entries_annihilated, 1);
        let mut iter = bl.level(0).unwrap().curr().iter().unwrap();
        while let Some(entry) = iter.next_entry().unwrap() {
            assert!(entry.is_metadata());
        }
    }

    #[test]
    fn test_hash_changes_with_content() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let counters = MergeCounters::new();
        let mut bl = BucketList::new();

        let genesis_hash = bl.hash();
        add_one(
            &mut bl,
            &mut store,
            &counters,
            1,
            vec![seeded_entry(1, b"v")],
            vec![],
            vec![],
        );
        assert_ne!(bl.hash(), genesis_hash);
    }

    #[test]
    fn test_spill_schedule_boundaries() {
        assert!(!BucketList::level_should_spill(0, 0));
        assert!(!BucketList::level_should_spill(49, 0));
        assert!(BucketList::level_should_spill(50, 0));
        assert!(!BucketList::level_should_spill(51, 0));
        assert!(BucketList::level_should_spill(100, 0));

        assert!(BucketList::level_should_spill(5_000, 1));
        assert!(!BucketList::level_should_spill(2_500, 1));
        assert!(BucketList::level_should_spill(50_000, 2));

        // The deepest level never spills.
        assert!(!BucketList::level_should_spill(u32::MAX, BUCKET_LIST_LEVELS - 1));
    }

    #[test]
    fn test_ledgers_until_spill() {
        assert_eq!(BucketList::ledgers_until_spill(0, 0), 50);
        assert_eq!(BucketList::ledgers_until_spill(49, 0), 1);
        assert_eq!(BucketList::ledgers_until_spill(50, 0), 50);
        assert_eq!(BucketList::ledgers_until_spill(4_999, 1), 1);
        assert_eq!(BucketList::ledgers_until_spill(5_000, 1), 5_000);
    }

    #[test]
    fn test_should_merge_with_empty_curr() {
        // Level 0 always merges with its curr.
        assert!(!BucketList::should_merge_with_empty_curr(50, 0));

        // Level 1 receives spills every 50 ledgers and spills itself
        // every 5000. Only the receive at 4950 stages a merge whose
        // promotion coincides with level 1's own spill.
        assert!(!BucketList::should_merge_with_empty_curr(4_900, 1));
        assert!(BucketList::should_merge_with_empty_curr(4_950, 1));
        assert!(!BucketList::should_merge_with_empty_curr(5_000, 1));
        assert!(BucketList::should_merge_with_empty_curr(9_950, 1));
    }

    #[test]
    fn test_entries_survive_level_zero_spills() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let counters = MergeCounters::new();
        let mut bl = BucketList::new();

        for ledger in 1..=120u32 {
            add_one(
                &mut bl,
                &mut store,
                &counters,
                ledger,
                vec![seeded_entry(ledger, b"payload")],
                vec![],
                vec![],
            );

            for prev in 1..=ledger {
                assert!(
                    bl.get(&seeded_key(prev)).unwrap().is_some(),
                    "entry {prev} lost at ledger {ledger}"
                );
            }
        }

        // Two level-0 spills happened; level 1 holds a staged merge.
        assert!(!bl.level(0).unwrap().snap().is_empty());
        assert!(bl.level(1).unwrap().next().is_some());
    }

    #[test]
    fn test_snapshot_ledger_stamps_header() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let counters = MergeCounters::new();
        let mut bl = BucketList::new();

        add_one(
            &mut bl,
            &mut store,
            &counters,
            49,
            vec![seeded_entry(1, b"v")],
            vec![],
            vec![],
        );

        let mut header = LedgerHeader::new(49, TEST_PROTOCOL);
        bl.snapshot_ledger(&mut header);

        assert_eq!(header.bucket_list_hash, bl.hash());
        assert_eq!(header.skip_values[0], 1);
        assert_eq!(header.skip_values[1], 4_951);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_out_of_order_batch_panics() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let counters = MergeCounters::new();
        let mut bl = BucketList::new();

        add_one(&mut bl, &mut store, &counters, 5, vec![], vec![], vec![]);
        add_one(&mut bl, &mut store, &counters, 5, vec![], vec![], vec![]);
    }

    #[test]
    fn test_determinism_across_instances() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let mut store_a = make_store(&dir_a);
        let mut store_b = make_store(&dir_b);
        let counters_a = MergeCounters::new();
        let counters_b = MergeCounters::new();
        let mut bl_a = BucketList::new();
        let mut bl_b = BucketList::new();

        for ledger in 1..=75u32 {
            let init = vec![seeded_entry(ledger, b"created")];
            let live = if ledger > 1 {
                vec![seeded_entry(ledger - 1, b"updated")]
            } else {
                vec![]
            };
            let dead = if ledger % 10 == 0 {
                vec![seeded_key(ledger / 2)]
            } else {
                vec![]
            };

            add_one(
                &mut bl_a,
                &mut store_a,
                &counters_a,
                ledger,
                init.clone(),
                live.clone(),
                dead.clone(),
            );
            add_one(&mut bl_b, &mut store_b, &counters_b, ledger, init, live, dead);

            assert_eq!(bl_a.hash(), bl_b.hash(), "divergence at ledger {ledger}");
        }
    }

    #[test]
    fn test_tombstone_dropped_at_configured_level() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let counters = MergeCounters::new();
        // Drop tombstones as soon as they reach level 1.
        let mut bl = BucketList::with_config(BucketListConfig {
            tombstone_drop_level: 1,
        });

        // A live entry, then its deletion in a later close. Written as a
        // LIVE update (not INIT) so the tombstone survives level 0.
        add_one(
            &mut bl,
            &mut store,
            &counters,
            1,
            vec![],
            vec![seeded_entry(1, b"v")],
            vec![],
        );
        add_one(
            &mut bl,
            &mut store,
            &counters,
            2,
            vec![],
            vec![],
            vec![seeded_key(1)],
        );

        // Push both closes through the first level-0 spill.
        for ledger in 3..=50u32 {
            add_one(&mut bl, &mut store, &counters, ledger, vec![], vec![], vec![]);
        }

        assert!(counters.snapshot().tombstones_dropped > 0);
        assert!(bl.get(&seeded_key(1)).unwrap().is_none());
    }
}
