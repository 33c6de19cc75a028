//! History archive state (HAS) manifests.
//!
//! The archive state is the wire contract for catch-up and restore: a
//! JSON document listing, for every bucket-list level, the expected
//! `curr` and `snap` hashes plus the state of the level's pending
//! merge. The manager consumes one in `assume_state` and produces one
//! for publication.
//!
//! The schema is fixed externally; this module only maps it to and from
//! the engine's types.

use serde::{Deserialize, Serialize};

use strata_common::Hash256;

use crate::bucket_list::{BucketList, BUCKET_LIST_LEVELS};
use crate::{BucketError, Result};

/// Pending-merge state discriminants used in `next` blocks.
pub const NEXT_STATE_CLEAR: u32 = 0;
pub const NEXT_STATE_OUTPUT: u32 = 1;
pub const NEXT_STATE_INPUTS: u32 = 2;

/// History archive state: the manifest describing a bucket list at a
/// given ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryArchiveState {
    /// Manifest format version.
    pub version: u32,

    /// Producing server identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Ledger sequence this state describes.
    pub current_ledger: u32,

    /// Network passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_passphrase: Option<String>,

    /// One entry per bucket-list level, shallowest first.
    pub current_buckets: Vec<HasBucketLevel>,
}

/// A single level in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HasBucketLevel {
    /// Current bucket hash (hex).
    pub curr: String,

    /// Snapshot bucket hash (hex).
    pub snap: String,

    /// Pending merge state.
    #[serde(default)]
    pub next: HasBucketNext,
}

/// Serialized state of a level's pending merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HasBucketNext {
    /// [`NEXT_STATE_CLEAR`], [`NEXT_STATE_OUTPUT`], or
    /// [`NEXT_STATE_INPUTS`].
    pub state: u32,

    /// Output bucket hash when `state` is [`NEXT_STATE_OUTPUT`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Input curr hash when `state` is [`NEXT_STATE_INPUTS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curr: Option<String>,

    /// Input snap hash when `state` is [`NEXT_STATE_INPUTS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap: Option<String>,
}

impl HistoryArchiveState {
    /// Manifest format version this engine writes.
    pub const CURRENT_VERSION: u32 = 1;

    /// Parse a manifest from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| BucketError::Serialization(format!("invalid archive state: {e}")))
    }

    /// Serialize this manifest to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| BucketError::Serialization(format!("archive state encode: {e}")))
    }

    /// Build a manifest describing a live bucket list.
    ///
    /// A staged merge serializes as [`NEXT_STATE_OUTPUT`] with its
    /// output hash: the merge is complete, only its promotion is
    /// pending.
    pub fn from_bucket_list(
        bucket_list: &BucketList,
        server: Option<String>,
        network_passphrase: Option<String>,
    ) -> Self {
        let current_buckets = bucket_list
            .levels()
            .iter()
            .map(|level| HasBucketLevel {
                curr: level.curr().hash().to_hex(),
                snap: level.snap().hash().to_hex(),
                next: match level.next() {
                    Some(next) => HasBucketNext {
                        state: NEXT_STATE_OUTPUT,
                        output: Some(next.hash().to_hex()),
                        curr: None,
                        snap: None,
                    },
                    None => HasBucketNext::default(),
                },
            })
            .collect();

        Self {
            version: Self::CURRENT_VERSION,
            server,
            current_ledger: bucket_list.ledger_seq(),
            network_passphrase,
            current_buckets,
        }
    }

    /// Validate the manifest's shape against the fixed level count.
    pub fn validate(&self) -> Result<()> {
        if self.current_buckets.len() != BUCKET_LIST_LEVELS {
            return Err(BucketError::Serialization(format!(
                "archive state has {} levels, expected {}",
                self.current_buckets.len(),
                BUCKET_LIST_LEVELS
            )));
        }
        Ok(())
    }

    /// Every distinct non-zero bucket hash the manifest references,
    /// pending-merge blocks included.
    pub fn all_bucket_hashes(&self) -> Result<Vec<Hash256>> {
        let mut hashes = Vec::new();
        let mut push = |hex: &str| -> Result<()> {
            let hash = parse_hash(hex)?;
            if !hash.is_zero() && !hashes.contains(&hash) {
                hashes.push(hash);
            }
            Ok(())
        };

        for level in &self.current_buckets {
            push(&level.curr)?;
            push(&level.snap)?;
            if let Some(output) = &level.next.output {
                push(output)?;
            }
            if let Some(curr) = &level.next.curr {
                push(curr)?;
            }
            if let Some(snap) = &level.next.snap {
                push(snap)?;
            }
        }
        Ok(hashes)
    }
}

/// Parse a manifest hash field.
pub(crate) fn parse_hash(hex: &str) -> Result<Hash256> {
    Hash256::from_hex(hex)
        .map_err(|e| BucketError::Serialization(format!("archive state hash: {e}")))
}
