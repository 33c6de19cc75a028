//! The minimal ledger header surface the bucket engine touches.
//!
//! The full ledger header lives with the host's close pipeline; the
//! bucket engine only reads the sequence/protocol fields and stamps the
//! state digest and skip slots during `snapshot_ledger`.

use crate::Hash256;

/// Number of skip-value slots carried in a ledger header.
///
/// These cover the shallowest levels of the bucket list, whose spill
/// cadence is short enough to be worth advertising per close.
pub const SKIP_SLOTS: usize = 4;

/// Host-side ledger header, reduced to the fields the state engine
/// reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerHeader {
    /// Sequence number of the ledger being closed.
    pub ledger_seq: u32,
    /// Protocol version in effect for this ledger.
    pub protocol_version: u32,
    /// Aggregate bucket-list hash, stamped by `snapshot_ledger`.
    pub bucket_list_hash: Hash256,
    /// Ledgers remaining until the next spill at each of the first
    /// [`SKIP_SLOTS`] levels, stamped by `snapshot_ledger`.
    pub skip_values: [u64; SKIP_SLOTS],
}

impl LedgerHeader {
    /// Create a header for the given sequence and protocol version.
    pub fn new(ledger_seq: u32, protocol_version: u32) -> Self {
        Self {
            ledger_seq,
            protocol_version,
            ..Default::default()
        }
    }
}
