//! Quorum oracle trait and static implementation.
//!
//! The agreement engine queries the current view for membership, fault
//! tolerance, and quorum thresholds; it never owns them.

use crate::{MacKey, ProcessId, PublicKey};
use std::collections::HashMap;
use std::sync::Arc;

/// Quorum oracle consulted by the consensus logic.
pub trait View: Send + Sync {
    /// Total number of acceptor processes.
    fn n(&self) -> usize;

    /// Number of tolerated faulty processes.
    fn f(&self) -> usize;

    /// Ordered (sorted) acceptor process ids.
    fn processes(&self) -> &[ProcessId];

    /// Whether Byzantine faults are tolerated (as opposed to crash-only).
    fn is_bft(&self) -> bool;

    /// Get the public key for a process.
    fn public_key(&self, id: ProcessId) -> Option<PublicKey>;

    /// Get the pairwise MAC key shared with a process.
    fn mac_key(&self, id: ProcessId) -> Option<MacKey>;

    // Derived methods

    /// Position of a process in the sorted acceptor list.
    fn position_of(&self, id: ProcessId) -> Option<usize> {
        self.processes().iter().position(|p| *p == id)
    }

    /// Check if a process is a member of the view.
    fn contains(&self, id: ProcessId) -> bool {
        self.position_of(id).is_some()
    }

    /// Votes required for a weak quorum (escalate WEAK to STRONG).
    ///
    /// Matching votes strictly above `(n + f) / 2` in BFT mode, above
    /// `n / 2` in crash-only mode.
    fn strong_quorum(&self) -> usize {
        if self.is_bft() {
            (self.n() + self.f()) / 2 + 1
        } else {
            self.n() / 2 + 1
        }
    }

    /// Votes required for a decision certificate.
    ///
    /// `2f + 1` in BFT mode, a simple majority in crash-only mode.
    fn certificate_quorum(&self) -> usize {
        if self.is_bft() {
            2 * self.f() + 1
        } else {
            self.n() / 2 + 1
        }
    }
}

/// A replica's entry in a static view.
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    /// Process id.
    pub process_id: ProcessId,

    /// Signature verification key.
    pub public_key: PublicKey,

    /// Pairwise MAC key shared between this replica and the local one.
    pub mac_key: MacKey,
}

/// Errors that can occur when constructing a view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViewError {
    /// Too few replicas for the requested fault tolerance.
    #[error("view of {n} replicas cannot tolerate {f} faults (need at least 3f+1)")]
    TooSmall {
        /// Replica count.
        n: usize,
        /// Requested fault tolerance.
        f: usize,
    },
}

/// A fixed-membership view.
#[derive(Debug, Clone)]
pub struct StaticView {
    processes: Vec<ProcessId>,
    f: usize,
    bft: bool,
    public_keys: HashMap<ProcessId, PublicKey>,
    mac_keys: HashMap<ProcessId, MacKey>,
}

impl StaticView {
    /// Create a Byzantine-tolerant view. Requires `n >= 3f + 1`.
    pub fn new(replicas: Vec<ReplicaInfo>, f: usize) -> Result<Self, ViewError> {
        Self::build(replicas, f, true)
    }

    /// Create a crash-fault-only view (no Byzantine tolerance).
    pub fn crash_fault_only(replicas: Vec<ReplicaInfo>, f: usize) -> Result<Self, ViewError> {
        Self::build(replicas, f, false)
    }

    fn build(replicas: Vec<ReplicaInfo>, f: usize, bft: bool) -> Result<Self, ViewError> {
        let n = replicas.len();
        let min = if bft { 3 * f + 1 } else { 2 * f + 1 };
        if n < min {
            return Err(ViewError::TooSmall { n, f });
        }

        let mut processes: Vec<ProcessId> = replicas.iter().map(|r| r.process_id).collect();
        processes.sort_unstable();

        let public_keys = replicas
            .iter()
            .map(|r| (r.process_id, r.public_key))
            .collect();
        let mac_keys = replicas.iter().map(|r| (r.process_id, r.mac_key)).collect();

        Ok(Self {
            processes,
            f,
            bft,
            public_keys,
            mac_keys,
        })
    }

    /// Create a view as an Arc.
    pub fn into_arc(self) -> Arc<dyn View> {
        Arc::new(self)
    }
}

impl View for StaticView {
    fn n(&self) -> usize {
        self.processes.len()
    }

    fn f(&self) -> usize {
        self.f
    }

    fn processes(&self) -> &[ProcessId] {
        &self.processes
    }

    fn is_bft(&self) -> bool {
        self.bft
    }

    fn public_key(&self, id: ProcessId) -> Option<PublicKey> {
        self.public_keys.get(&id).copied()
    }

    fn mac_key(&self, id: ProcessId) -> Option<MacKey> {
        self.mac_keys.get(&id).copied()
    }
}
