//! BucketManager - owns bucket files on disk.
//!
//! The manager is the single owner of the bucket directory. It interns
//! every bucket by content hash so that identical buckets (frequent,
//! since levels repeatedly produce the same empty or unchanged buckets)
//! share one file and one in-memory handle, and it is the only component
//! that ever deletes a bucket file.
//!
//! # File layout
//!
//! ```text
//! <bucket_dir>/
//!   strata.lock            exclusive-access lock file
//!   <hex hash>.bucket.gz   one file per distinct bucket
//!   tmp/                   in-progress merge output
//! ```
//!
//! Merge output is written under `tmp/` and renamed into place (with a
//! parent-directory fsync) once its hash is known; a crash never leaves
//! a partial file under a bucket's final name.
//!
//! # Locking
//!
//! All structural state (the intern table, the bucket list's level
//! slots, and the pin counts) lives behind one mutex. Public methods
//! lock it exactly once and thread `&mut BucketStore` through internal
//! calls, so nested operations (a close triggering spill merges that
//! intern their outputs) never re-acquire the lock. Merge computation
//! itself only reads immutable bucket files and could run outside the
//! lock; registration of outputs and level-slot swaps cannot.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use strata_common::{durable_rename, Hash256, LedgerHeader};

use crate::archive_state::{
    parse_hash, HistoryArchiveState, NEXT_STATE_INPUTS, NEXT_STATE_OUTPUT,
};
use crate::bucket::Bucket;
use crate::bucket_list::{BucketLevel, BucketList, BucketListConfig};
use crate::entry::{BucketEntry, EntryKey, LedgerEntry};
use crate::iterator::{scan_bucket_file, BucketOutput, BucketOutputIter};
use crate::merge::{merge_buckets, MergeOptions};
use crate::metrics::{MergeCounters, MergeCountersSnapshot};
use crate::{BucketError, Result};

/// Extension of every bucket file.
pub const BUCKET_FILE_EXTENSION: &str = ".bucket.gz";

const LOCK_FILENAME: &str = "strata.lock";
const TMP_DIR_NAME: &str = "tmp";

/// The interned bucket table plus the directories bucket files live in.
///
/// Normally owned by a [`BucketManager`] and mutated only under its
/// lock; holding a `&mut BucketStore` *is* the capability to mutate
/// shared state, which is how nested calls avoid reentrant locking.
pub struct BucketStore {
    bucket_dir: PathBuf,
    tmp_dir: PathBuf,
    buckets: HashMap<Hash256, Arc<Bucket>>,
    tmp_seq: u64,
}

impl BucketStore {
    /// Create a store over the given directories, creating them if
    /// needed.
    pub fn new(bucket_dir: PathBuf, tmp_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&bucket_dir)?;
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            bucket_dir,
            tmp_dir,
            buckets: HashMap::new(),
            tmp_seq: 0,
        })
    }

    /// The canonical file path for a bucket hash.
    pub fn bucket_filename(&self, hash: &Hash256) -> PathBuf {
        self.bucket_dir
            .join(format!("{}{}", hash.to_hex(), BUCKET_FILE_EXTENSION))
    }

    /// A fresh path under the temp workspace for in-progress output.
    fn fresh_tmp_path(&mut self) -> PathBuf {
        self.tmp_seq += 1;
        self.tmp_dir.join(format!("merge-{:06}.tmp", self.tmp_seq))
    }

    /// Look up an interned bucket.
    pub fn get(&self, hash: &Hash256) -> Option<Arc<Bucket>> {
        self.buckets.get(hash).cloned()
    }

    /// Whether a hash is interned.
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.buckets.contains_key(hash)
    }

    /// All interned hashes.
    pub fn hashes(&self) -> Vec<Hash256> {
        self.buckets.keys().copied().collect()
    }

    /// Number of interned buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn remove(&mut self, hash: &Hash256) -> Option<Arc<Bucket>> {
        self.buckets.remove(hash)
    }

    /// Intern a finished output file: dedup against the table, or
    /// rename it into the bucket directory under its hash.
    fn intern_output(
        &mut self,
        output: BucketOutput,
        counters: &MergeCounters,
    ) -> Result<Arc<Bucket>> {
        if let Some(existing) = self.buckets.get(&output.hash) {
            fs::remove_file(&output.path)?;
            counters
                .output_reuses
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::trace!(hash = %output.hash, "merge output already interned, reusing");
            return Ok(Arc::clone(existing));
        }

        let dest = self.bucket_filename(&output.hash);
        durable_rename(&output.path, &dest)?;

        let bucket = Arc::new(Bucket::from_parts(
            output.hash,
            dest,
            output.object_count,
            output.byte_size,
        ));
        self.buckets.insert(output.hash, Arc::clone(&bucket));
        Ok(bucket)
    }

    /// Write a new bucket from entries already in bucket order.
    pub fn write_bucket(
        &mut self,
        entries: Vec<BucketEntry>,
        counters: &MergeCounters,
    ) -> Result<Arc<Bucket>> {
        if entries.is_empty() {
            return Ok(Arc::new(Bucket::empty()));
        }

        let path = self.fresh_tmp_path();
        let mut writer = BucketOutputIter::create(path.clone())?;
        let result = (|| -> Result<Option<BucketOutput>> {
            for entry in &entries {
                writer.put(entry)?;
            }
            writer.finish()
        })();

        match result {
            Ok(Some(output)) => {
                counters
                    .bytes_written
                    .fetch_add(output.byte_size, std::sync::atomic::Ordering::Relaxed);
                self.intern_output(output, counters)
            }
            Ok(None) => Ok(Arc::new(Bucket::empty())),
            Err(e) => {
                let _ = fs::remove_file(&path);
                Err(e)
            }
        }
    }

    /// Merge two buckets and intern the result.
    pub fn merge(
        &mut self,
        old: &Bucket,
        new: &Bucket,
        options: &MergeOptions,
        counters: &MergeCounters,
    ) -> Result<Arc<Bucket>> {
        let path = self.fresh_tmp_path();
        match merge_buckets(old, new, options, path, counters)? {
            Some(output) => self.intern_output(output, counters),
            None => Ok(Arc::new(Bucket::empty())),
        }
    }

    /// Take ownership of an externally produced bucket file.
    ///
    /// The file is re-scanned; its content must hash to `expected_hash`
    /// or the adoption fails without touching the table. If the hash is
    /// already interned the new file is discarded and the shared
    /// instance returned.
    pub fn adopt_file(
        &mut self,
        path: &Path,
        expected_hash: &Hash256,
        n_objects: u64,
        n_bytes: u64,
    ) -> Result<Arc<Bucket>> {
        let scan = scan_bucket_file(path)?;
        if scan.hash != *expected_hash {
            return Err(BucketError::HashMismatch {
                expected: expected_hash.to_hex(),
                actual: scan.hash.to_hex(),
            });
        }
        if scan.object_count != n_objects || scan.byte_size != n_bytes {
            tracing::warn!(
                hash = %expected_hash,
                claimed_objects = n_objects,
                scanned_objects = scan.object_count,
                claimed_bytes = n_bytes,
                scanned_bytes = scan.byte_size,
                "adopted bucket counts disagree with scan, recording scanned values"
            );
        }

        if let Some(existing) = self.buckets.get(expected_hash) {
            fs::remove_file(path)?;
            tracing::debug!(hash = %expected_hash, "adopted duplicate bucket, reusing shared instance");
            return Ok(Arc::clone(existing));
        }

        let dest = self.bucket_filename(expected_hash);
        durable_rename(path, &dest)?;

        let bucket = Arc::new(Bucket::from_parts(
            scan.hash,
            dest,
            scan.object_count,
            scan.byte_size,
        ));
        self.buckets.insert(scan.hash, Arc::clone(&bucket));
        Ok(bucket)
    }

    /// Resolve a hash to a shared bucket: interned, or loaded from its
    /// file on disk.
    ///
    /// Fails with [`BucketError::MissingBucket`] when no file exists and
    /// [`BucketError::HashMismatch`] when the file's content does not
    /// hash to its name (corruption - never silently recovered).
    pub fn load(&mut self, hash: &Hash256) -> Result<Arc<Bucket>> {
        if hash.is_zero() {
            return Ok(Arc::new(Bucket::empty()));
        }
        if let Some(bucket) = self.buckets.get(hash) {
            return Ok(Arc::clone(bucket));
        }

        let path = self.bucket_filename(hash);
        if !path.exists() {
            return Err(BucketError::MissingBucket(hash.to_hex()));
        }

        let bucket = Bucket::open(&path)?;
        if bucket.hash() != *hash {
            return Err(BucketError::HashMismatch {
                expected: hash.to_hex(),
                actual: bucket.hash().to_hex(),
            });
        }

        let bucket = Arc::new(bucket);
        self.buckets.insert(*hash, Arc::clone(&bucket));
        Ok(bucket)
    }
}

impl std::fmt::Debug for BucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStore")
            .field("bucket_dir", &self.bucket_dir)
            .field("interned", &self.buckets.len())
            .finish()
    }
}

struct ManagerInner {
    store: BucketStore,
    bucket_list: BucketList,
    /// External holds (e.g. an in-flight history publish), by hash.
    pinned: HashMap<Hash256, u64>,
}

/// Owner of the bucket directory, the intern table, and the bucket
/// list.
///
/// # Example
///
/// ```ignore
/// let manager = BucketManager::new("/var/lib/strata/buckets".into())?;
/// manager.initialize()?;
///
/// // Once per ledger close:
/// manager.add_batch(seq, protocol, init_entries, live_entries, dead_entries)?;
/// manager.snapshot_ledger(&mut header);
///
/// // Periodically:
/// manager.forget_unreferenced_buckets();
/// ```
pub struct BucketManager {
    bucket_dir: PathBuf,
    tmp_dir: PathBuf,
    lock_path: PathBuf,
    config: BucketListConfig,
    inner: Mutex<ManagerInner>,
    counters: Arc<MergeCounters>,
    locked: Mutex<bool>,
    #[cfg(any(test, feature = "testutils"))]
    next_close_override: Mutex<Option<(u32, Hash256)>>,
}

impl BucketManager {
    /// Create a manager over a bucket directory, creating the directory
    /// and temp workspace if needed. Call [`initialize`] before use.
    ///
    /// [`initialize`]: BucketManager::initialize
    pub fn new(bucket_dir: PathBuf) -> Result<Self> {
        Self::with_config(bucket_dir, BucketListConfig::default())
    }

    /// Create a manager with explicit bucket-list policy.
    pub fn with_config(bucket_dir: PathBuf, config: BucketListConfig) -> Result<Self> {
        let tmp_dir = bucket_dir.join(TMP_DIR_NAME);
        let lock_path = bucket_dir.join(LOCK_FILENAME);
        let store = BucketStore::new(bucket_dir.clone(), tmp_dir.clone())?;

        Ok(Self {
            bucket_dir,
            tmp_dir,
            lock_path,
            config,
            inner: Mutex::new(ManagerInner {
                store,
                bucket_list: BucketList::with_config(config),
                pinned: HashMap::new(),
            }),
            counters: Arc::new(MergeCounters::new()),
            locked: Mutex::new(false),
            #[cfg(any(test, feature = "testutils"))]
            next_close_override: Mutex::new(None),
        })
    }

    /// Acquire exclusive access to the bucket directory and prepare the
    /// temp workspace.
    ///
    /// Fails with [`BucketError::AlreadyRunning`] when another process
    /// holds the lock file.
    pub fn initialize(&self) -> Result<()> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BucketError::AlreadyRunning(
                    self.lock_path.display().to_string(),
                ));
            }
            Err(e) => return Err(BucketError::Io(e)),
        }
        *self.locked.lock() = true;

        // A prior unclean shutdown may have left merge output behind.
        Self::clean_dir(&self.tmp_dir);

        tracing::info!(bucket_dir = %self.bucket_dir.display(), "bucket manager initialized");
        Ok(())
    }

    /// Release the bucket directory lock.
    pub fn shutdown(&self) {
        let mut locked = self.locked.lock();
        if *locked {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                tracing::warn!(error = %e, "failed to remove bucket directory lock file");
            }
            *locked = false;
        }
    }

    /// The bucket directory.
    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    /// The temp workspace directory.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// The canonical file path for a bucket hash.
    pub fn bucket_filename(&self, hash: &Hash256) -> PathBuf {
        self.bucket_dir
            .join(format!("{}{}", hash.to_hex(), BUCKET_FILE_EXTENSION))
    }

    /// Absorb one closed ledger's entry deltas into the bucket list.
    ///
    /// Called exactly once per close, in strictly increasing ledger
    /// order. Spill merges triggered by the close run inside this call
    /// and their outputs are interned before it returns.
    pub fn add_batch(
        &self,
        ledger_seq: u32,
        protocol_version: u32,
        init_entries: Vec<LedgerEntry>,
        live_entries: Vec<LedgerEntry>,
        dead_entries: Vec<EntryKey>,
    ) -> Result<()> {
        #[cfg(any(test, feature = "testutils"))]
        let protocol_version = match *self.next_close_override.lock() {
            Some((version, _)) => version,
            None => protocol_version,
        };

        let mut inner = self.inner.lock();
        let ManagerInner {
            store, bucket_list, ..
        } = &mut *inner;

        bucket_list.add_batch(
            store,
            &self.counters,
            ledger_seq,
            protocol_version,
            init_entries,
            live_entries,
            dead_entries,
        )
    }

    /// Stamp the aggregate bucket-list hash and skip values into the
    /// header being closed. Called once per close, after
    /// [`add_batch`](BucketManager::add_batch).
    pub fn snapshot_ledger(&self, header: &mut LedgerHeader) {
        let inner = self.inner.lock();
        inner.bucket_list.snapshot_ledger(header);

        #[cfg(any(test, feature = "testutils"))]
        if let Some((_, hash)) = self.next_close_override.lock().take() {
            header.bucket_list_hash = hash;
        }
    }

    /// The current aggregate bucket-list hash.
    pub fn bucket_list_hash(&self) -> Hash256 {
        self.inner.lock().bucket_list.hash()
    }

    /// Sequence of the last ledger absorbed.
    pub fn ledger_seq(&self) -> u32 {
        self.inner.lock().bucket_list.ledger_seq()
    }

    /// Look up a live ledger entry across the whole bucket list.
    pub fn get_ledger_entry(&self, key: &EntryKey) -> Result<Option<LedgerEntry>> {
        self.inner.lock().bucket_list.get(key)
    }

    /// The net set of live entries across the whole bucket list.
    pub fn live_entries(&self) -> Result<Vec<LedgerEntry>> {
        self.inner.lock().bucket_list.live_entries()
    }

    /// Run a closure against the bucket list under the manager's lock.
    pub fn with_bucket_list<R>(&self, f: impl FnOnce(&BucketList) -> R) -> R {
        f(&self.inner.lock().bucket_list)
    }

    /// Take ownership of an externally produced bucket file, verifying
    /// and interning it. A duplicate file for an already-interned hash
    /// is discarded and the shared instance returned.
    pub fn adopt_file_as_bucket(
        &self,
        path: &Path,
        expected_hash: &Hash256,
        n_objects: u64,
        n_bytes: u64,
    ) -> Result<Arc<Bucket>> {
        self.inner
            .lock()
            .store
            .adopt_file(path, expected_hash, n_objects, n_bytes)
    }

    /// Look up an interned bucket by hash.
    ///
    /// Never touches disk; the zero hash resolves to the canonical
    /// empty bucket.
    pub fn get_bucket_by_hash(&self, hash: &Hash256) -> Option<Arc<Bucket>> {
        if hash.is_zero() {
            return Some(Arc::new(Bucket::empty()));
        }
        self.inner.lock().store.get(hash)
    }

    /// Pin a hash so garbage collection treats it as referenced (e.g.
    /// for the duration of a history publish). Pins nest.
    pub fn pin_bucket(&self, hash: Hash256) {
        if hash.is_zero() {
            return;
        }
        *self.inner.lock().pinned.entry(hash).or_insert(0) += 1;
    }

    /// Release one pin on a hash.
    pub fn unpin_bucket(&self, hash: &Hash256) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.pinned.get_mut(hash) {
            *count -= 1;
            if *count == 0 {
                inner.pinned.remove(hash);
            }
        }
    }

    fn referenced_set(inner: &ManagerInner) -> HashSet<Hash256> {
        let mut referenced: HashSet<Hash256> = inner
            .bucket_list
            .referenced_hashes()
            .into_iter()
            .filter(|hash| !hash.is_zero())
            .collect();
        referenced.extend(inner.pinned.keys().copied());
        referenced
    }

    /// The set of hashes reachable from every level slot (staged merges
    /// included) plus all pinned hashes. Pure reachability scan, no
    /// I/O.
    pub fn get_referenced_buckets(&self) -> HashSet<Hash256> {
        Self::referenced_set(&self.inner.lock())
    }

    /// Drop every interned bucket that no level slot references, no pin
    /// holds, and no external handle keeps alive, deleting its backing
    /// file.
    ///
    /// Runs entirely under the manager's lock, so a bucket can never be
    /// deleted between being computed as unreferenced and being
    /// referenced by a just-completed merge. Per-file delete failures
    /// are logged and the entry retained for a later sweep.
    pub fn forget_unreferenced_buckets(&self) {
        let mut inner = self.inner.lock();
        let referenced = Self::referenced_set(&inner);

        let candidates: Vec<Hash256> = inner
            .store
            .hashes()
            .into_iter()
            .filter(|hash| !referenced.contains(hash))
            .collect();

        let mut dropped = 0usize;
        for hash in candidates {
            let Some(bucket) = inner.store.get(&hash) else {
                continue;
            };
            // Two strong counts are ours: the table's and this lookup's.
            // More means some caller still holds the bucket; its file
            // must outlive that handle.
            if Arc::strong_count(&bucket) > 2 {
                continue;
            }

            match fs::remove_file(bucket.filename()) {
                Ok(()) => {
                    inner.store.remove(&hash);
                    dropped += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    inner.store.remove(&hash);
                    dropped += 1;
                }
                Err(e) => {
                    tracing::warn!(hash = %hash, error = %e, "failed to delete unreferenced bucket file");
                }
            }
        }

        if dropped > 0 {
            tracing::debug!(dropped, remaining = inner.store.len(), "forgot unreferenced buckets");
        }
    }

    /// Given an archive manifest, list the referenced hashes whose
    /// backing files are absent locally. Pure read-only check; the
    /// designed signal telling the host what to fetch before
    /// [`assume_state`](BucketManager::assume_state).
    pub fn check_for_missing_buckets_files(
        &self,
        has: &HistoryArchiveState,
    ) -> Result<Vec<Hash256>> {
        let mut missing = Vec::new();
        for hash in has.all_bucket_hashes()? {
            if !self.bucket_filename(&hash).exists() {
                missing.push(hash);
            }
        }
        Ok(missing)
    }

    /// Replace the in-memory bucket list to match an archive manifest.
    ///
    /// Every referenced file must already be present (fails with
    /// [`BucketError::MissingBucket`] otherwise - run
    /// [`check_for_missing_buckets_files`] first) and no bucket may
    /// carry a protocol version above `max_protocol_version`. The new
    /// level structure is installed atomically: concurrent readers see
    /// either the old state or the new, never a partial mix.
    ///
    /// A serialized pending merge is restored from its output hash, or
    /// re-run from its input hashes - merges are deterministic, so the
    /// re-run reproduces the original output bit for bit.
    ///
    /// [`check_for_missing_buckets_files`]: BucketManager::check_for_missing_buckets_files
    pub fn assume_state(
        &self,
        has: &HistoryArchiveState,
        max_protocol_version: u32,
    ) -> Result<()> {
        has.validate()?;

        let mut inner = self.inner.lock();
        let ManagerInner {
            store, bucket_list, ..
        } = &mut *inner;

        let mut levels = Vec::with_capacity(has.current_buckets.len());
        for (i, level) in has.current_buckets.iter().enumerate() {
            let curr = Self::resolve_bucket(store, &level.curr, max_protocol_version)?;
            let snap = Self::resolve_bucket(store, &level.snap, max_protocol_version)?;

            let next = match level.next.state {
                NEXT_STATE_OUTPUT => {
                    let output = level.next.output.as_deref().ok_or_else(|| {
                        BucketError::Serialization(
                            "next state is output but no output hash given".to_string(),
                        )
                    })?;
                    Some(Self::resolve_bucket(store, output, max_protocol_version)?)
                }
                NEXT_STATE_INPUTS => {
                    let curr_in = level.next.curr.as_deref().ok_or_else(|| {
                        BucketError::Serialization(
                            "next state is inputs but no curr hash given".to_string(),
                        )
                    })?;
                    let snap_in = level.next.snap.as_deref().ok_or_else(|| {
                        BucketError::Serialization(
                            "next state is inputs but no snap hash given".to_string(),
                        )
                    })?;
                    let curr_in = Self::resolve_bucket(store, curr_in, max_protocol_version)?;
                    let snap_in = Self::resolve_bucket(store, snap_in, max_protocol_version)?;

                    let keep_tombstones = i < self.config.tombstone_drop_level;
                    let options = MergeOptions {
                        keep_tombstones,
                        normalize_init: !keep_tombstones,
                        protocol_version_ceiling: max_protocol_version,
                    };
                    Some(store.merge(&curr_in, &snap_in, &options, &self.counters)?)
                }
                _ => None,
            };

            levels.push(BucketLevel::from_buckets(i, curr, snap, next));
        }

        *bucket_list = BucketList::from_levels(levels, has.current_ledger, self.config)?;

        tracing::info!(
            ledger_seq = has.current_ledger,
            hash = %bucket_list.hash(),
            "assumed bucket list state from archive manifest"
        );
        Ok(())
    }

    fn resolve_bucket(
        store: &mut BucketStore,
        hex: &str,
        max_protocol_version: u32,
    ) -> Result<Arc<Bucket>> {
        let hash = parse_hash(hex)?;
        let bucket = store.load(&hash)?;
        if let Some(version) = bucket.protocol_version()? {
            if version > max_protocol_version {
                return Err(BucketError::UnsupportedProtocol {
                    version,
                    max: max_protocol_version,
                });
            }
        }
        Ok(bucket)
    }

    /// Produce the archive manifest describing the current bucket list.
    pub fn history_archive_state(
        &self,
        server: Option<String>,
        network_passphrase: Option<String>,
    ) -> HistoryArchiveState {
        HistoryArchiveState::from_bucket_list(
            &self.inner.lock().bucket_list,
            server,
            network_passphrase,
        )
    }

    /// Best-effort removal of files left by a prior unclean shutdown:
    /// anything in the bucket directory that is not the lock file, the
    /// temp workspace, or a currently-interned bucket, plus everything
    /// in the temp workspace.
    pub fn cleanup_stale_files(&self) {
        let inner = self.inner.lock();

        let entries = match fs::read_dir(&self.bucket_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "failed to scan bucket directory for stale files");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path == self.lock_path || path == self.tmp_dir {
                continue;
            }

            let interned = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(hash_from_filename)
                .is_some_and(|hash| inner.store.contains(&hash));
            if interned {
                continue;
            }

            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale file");
            } else {
                tracing::debug!(path = %path.display(), "removed stale file");
            }
        }

        Self::clean_dir(&self.tmp_dir);
    }

    /// Best-effort removal of every file in a directory.
    fn clean_dir(dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove temp file");
            }
        }
    }

    /// Snapshot the shared merge counters.
    pub fn read_merge_counters(&self) -> MergeCountersSnapshot {
        // Taken under the lock so the snapshot is consistent with no
        // merge mid-flight.
        let _inner = self.inner.lock();
        self.counters.snapshot()
    }

    /// Snapshot the shared merge counters and reset them to zero.
    pub fn read_and_clear_merge_counters(&self) -> MergeCountersSnapshot {
        let _inner = self.inner.lock();
        let snapshot = self.counters.snapshot();
        self.counters.reset();
        snapshot
    }

    /// Accumulate externally gathered deltas into the shared counters.
    pub fn incr_merge_counters(&self, delta: &MergeCountersSnapshot) {
        self.counters.combine(delta);
    }

    /// Install a fake protocol version and bucket-list hash for the
    /// next close. The protocol applies to the next
    /// [`add_batch`](BucketManager::add_batch); the hash replaces the
    /// stamped digest in the next
    /// [`snapshot_ledger`](BucketManager::snapshot_ledger), which
    /// clears the override. Exists only for deterministic reproduction
    /// of historical replay edge cases.
    #[cfg(any(test, feature = "testutils"))]
    pub fn set_next_close_version_and_hash_for_testing(
        &self,
        protocol_version: u32,
        bucket_list_hash: Hash256,
    ) {
        *self.next_close_override.lock() = Some((protocol_version, bucket_list_hash));
    }
}

impl Drop for BucketManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BucketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BucketManager")
            .field("bucket_dir", &self.bucket_dir)
            .field("interned", &inner.store.len())
            .field("ledger_seq", &inner.bucket_list.ledger_seq())
            .finish()
    }
}

/// Parse `<hex>.bucket.gz` back into a hash.
fn hash_from_filename(name: &str) -> Option<Hash256> {
    let hex = name.strip_suffix(BUCKET_FILE_EXTENSION)?;
    Hash256::from_hex(hex).ok()
}
