//! Stop sets: append-only membership sets over link keys.
//!
//! DoubleTree terminates a trace the moment it reaches a link some trace has
//! already recorded. Links are identified by [`StopKey`] strings and stored in
//! a [`StopSet`]. Two interchangeable representations exist:
//!
//! - [`ExactSet`]: hash set, no false positives, memory grows with keys seen
//! - [`BloomSet`]: fixed-size bit array, bounded memory, false positives only
//!
//! Which one a deployment uses is chosen once at startup (see
//! [`StopSetConfig`](crate::config::StopSetConfig)); every component above this
//! module is generic over the [`StopSet`] trait. Shared instances are wrapped
//! in [`SafeSet`].

pub mod bloom;
pub mod exact;
pub mod safe;

pub use bloom::*;
pub use exact::*;
pub use safe::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Canonical key for a directed link between a responder and a reference address.
///
/// Forward keys pair a hop with the trace destination, backward keys pair a hop
/// with the probing source. Both render as `"hop-reference"`; the same physical
/// link discovered in both directions produces two distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StopKey(String);

impl StopKey {
    /// Key for a hop seen while probing toward `destination`
    pub fn forward(responder: Ipv4Addr, destination: Ipv4Addr) -> Self {
        Self(format!("{}-{}", responder, destination))
    }

    /// Key for a hop closed while probing back toward `source`
    pub fn backward(hop: Ipv4Addr, source: Ipv4Addr) -> Self {
        Self(format!("{}-{}", hop, source))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StopKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StopKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from combining or importing stop sets
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StopSetError {
    #[error("cannot merge a {found} stop set into a {expected} stop set")]
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error(
        "bloom geometry mismatch: expected {expected_bits} bits/{expected_hashes} hashes, \
         got {found_bits} bits/{found_hashes} hashes"
    )]
    GeometryMismatch {
        expected_bits: u64,
        expected_hashes: u32,
        found_bits: u64,
        found_hashes: u32,
    },
    #[error("invalid stop set snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Portable form of a stop set, sent across the leader/monitor boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StopSetSnapshot {
    Exact {
        keys: Vec<String>,
    },
    Bloom {
        num_bits: u64,
        num_hashes: u32,
        words: Vec<u64>,
    },
}

impl StopSetSnapshot {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exact { .. } => ExactSet::KIND,
            Self::Bloom { .. } => BloomSet::KIND,
        }
    }

    /// An empty exact snapshot (used when a reply carries no set)
    pub fn empty() -> Self {
        Self::Exact { keys: Vec::new() }
    }
}

/// Sizing parameters for a new stop set.
///
/// Only the probabilistic representation uses them; the exact set ignores them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopSetParams {
    pub expected_items: u64,
    pub false_positive_rate: f64,
}

impl Default for StopSetParams {
    fn default() -> Self {
        // n=4000, p=1e-7 sizes the bit array at ~134k bits
        Self {
            expected_items: 4000,
            false_positive_rate: 1e-7,
        }
    }
}

/// Append-only membership set over opaque string keys.
///
/// `union_with` is commutative in effect and idempotent. There is no removal;
/// `wipe` resets to empty while keeping the set's configured size.
pub trait StopSet: Send + Sync + Sized + 'static {
    /// Short name of this representation, used in errors and snapshots
    const KIND: &'static str;

    /// Create an empty set sized by `params`
    fn with_params(params: &StopSetParams) -> Self;

    /// Create an empty set with the same size and shape as `self`
    fn empty_like(&self) -> Self;

    fn add(&mut self, key: &str);

    fn contains(&self, key: &str) -> bool;

    /// Merge every member of `other` into `self`
    fn union_with(&mut self, other: &Self) -> Result<(), StopSetError>;

    /// Merge a snapshot into `self`. Nothing is mutated on error.
    fn union_snapshot(&mut self, snapshot: &StopSetSnapshot) -> Result<(), StopSetError>;

    /// Reset to empty, preserving the configured size
    fn wipe(&mut self);

    /// Number of members (exact) or set bits (bloom)
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_snapshot(&self) -> StopSetSnapshot;

    /// Build a set from a snapshot, using `params` for any sizing the snapshot omits
    fn from_snapshot(
        snapshot: &StopSetSnapshot,
        params: &StopSetParams,
    ) -> Result<Self, StopSetError> {
        let mut set = Self::with_params(params);
        set.union_snapshot(snapshot)?;
        Ok(set)
    }
}
