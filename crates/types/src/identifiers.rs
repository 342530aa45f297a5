//! Domain-specific identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Replica process identifier.
///
/// Process ids are arbitrary but unique within a view; leader rotation
/// walks them in sorted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process({})", self.0)
    }
}

/// Consensus instance identifier (one decided value per id, ever).
///
/// Monotonically assigned. `-1` is the pre-genesis sentinel used for
/// "nothing decided yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsensusId(pub i64);

impl ConsensusId {
    /// Sentinel for a replica that has not decided any instance.
    pub const NONE: Self = ConsensusId(-1);

    /// The next consensus instance.
    pub fn next(self) -> Self {
        ConsensusId(self.0 + 1)
    }
}

impl fmt::Display for ConsensusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Consensus({})", self.0)
    }
}

/// Leader-change epoch counter.
///
/// Each timeout/suspicion negotiates the next regency; installing it
/// rotates the leader. Comparisons with `<=` prune stale bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Regency(pub u64);

impl Regency {
    /// The initial regency installed at bootstrap.
    pub const INITIAL: Self = Regency(0);

    /// The regency that follows this one.
    pub fn next(self) -> Self {
        Regency(self.0 + 1)
    }
}

impl fmt::Display for Regency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Regency({})", self.0)
    }
}
