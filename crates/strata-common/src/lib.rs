//! Shared vocabulary types for strata.
//!
//! This crate holds the small set of types that cross subsystem
//! boundaries: the [`Hash256`] content hash used to identify buckets and
//! ledger state, the minimal [`LedgerHeader`] the host stamps at each
//! ledger close, and crash-safe filesystem primitives.

mod fs;
mod header;
mod types;

pub use fs::durable_rename;
pub use header::{LedgerHeader, SKIP_SLOTS};
pub use types::{Hash256, HashParseError};
