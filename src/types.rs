//! Shared identifier and counter types for the coordination core.
//!
//! Every index that crosses a component boundary gets its own newtype so a
//! timeslice index can never be handed to something expecting a descriptor
//! index. All are u64-backed for wrap-safety except [`ConnectionId`], which
//! doubles as a bounds-checked position into per-connection tables.

use serde::{Deserialize, Serialize};

/// Identifies one (input, compute) connection pair within a node process.
///
/// Connection ids are dense: a node with `n` peers uses ids `0..n`, so the
/// id is also the index into every per-connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Position into per-connection tables.
    #[inline]
    #[must_use]
    pub const fn idx(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for ConnectionId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Which side of the pipeline a connection endpoint belongs to.
///
/// Input and compute connection ids are both dense from zero, so any id
/// that crosses between the two sides must carry its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Role {
    Input,
    Compute,
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Compute => f.write_str("compute"),
        }
    }
}

/// Index of one aligned timeslice window in the global stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct TimesliceIndex(pub u64);

impl TimesliceIndex {
    pub const ZERO: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Next timeslice index (wraps on overflow).
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl From<u64> for TimesliceIndex {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl core::fmt::Display for TimesliceIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ts{}", self.0)
    }
}

/// Index of one descriptor record in a connection's descriptor stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct DescIndex(pub u64);

impl DescIndex {
    pub const ZERO: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for DescIndex {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Index of one pacing interval (a run of consecutive rounds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct IntervalIndex(pub u64);

impl IntervalIndex {
    pub const ZERO: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl From<u64> for IntervalIndex {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl core::fmt::Display for IntervalIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "iv{}", self.0)
    }
}

/// Heartbeat sequence number, echoed by the peer for round-trip correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct HeartbeatSeq(pub u64);

impl HeartbeatSeq {
    /// Start a sequence at a random point so stale messages from a previous
    /// incarnation of the process are not mistaken for fresh ones.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for HeartbeatSeq {
    fn from(v: u64) -> Self {
        Self(v)
    }
}
