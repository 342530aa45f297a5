//! Leader-change collect structures.
//!
//! During a regency change every replica reports its write history for the
//! contested consensus instance: the last value it observed a write quorum
//! for, and the set of all (epoch, value) pairs it ever wrote. The new
//! leader's recovery predicates run over these snapshots.

use crate::{ConsensusId, Hash, ProcessId, Regency};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// An (epoch, value) pair from a replica's write history.
///
/// Equality and ordering consider only `(timestamp, value)`; the hash is a
/// derived cache filled in during collect normalization and must never be
/// trusted off the wire.
#[derive(Clone, Serialize, Deserialize)]
pub struct TimestampValuePair {
    /// Epoch at which the value was written.
    pub timestamp: u64,

    /// The raw written value (empty when nothing was written).
    pub value: Vec<u8>,

    /// Cached hash of `value`; empty bytes for an empty value.
    pub hashed: Vec<u8>,
}

impl TimestampValuePair {
    /// Create a pair with an unset hash cache.
    pub fn new(timestamp: u64, value: Vec<u8>) -> Self {
        Self {
            timestamp,
            value,
            hashed: Vec::new(),
        }
    }

    /// The "nothing ever written" pair.
    pub fn empty() -> Self {
        Self::new(0, Vec::new())
    }

    /// Recompute the hash cache from the raw value.
    ///
    /// Empty values hash to empty bytes; the digest is never invoked on
    /// empty input.
    pub fn rehash(&mut self) {
        self.hashed = hash_value(&self.value);
    }

    /// Whether this pair represents "nothing ever written".
    pub fn is_empty(&self) -> bool {
        self.timestamp == 0 && self.value.is_empty()
    }
}

/// Hash a raw value the way collect normalization does.
///
/// Empty input maps to empty bytes without invoking the digest.
pub fn hash_value(value: &[u8]) -> Vec<u8> {
    if value.is_empty() {
        Vec::new()
    } else {
        Hash::from_bytes(value).to_bytes().to_vec()
    }
}

impl PartialEq for TimestampValuePair {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.value == other.value
    }
}

impl Eq for TimestampValuePair {}

impl PartialOrd for TimestampValuePair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimestampValuePair {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl fmt::Debug for TimestampValuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {} bytes)", self.timestamp, self.value.len())
    }
}

/// A replica's leader-change snapshot for one consensus instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectData {
    /// Replica reporting the snapshot.
    pub sender: ProcessId,

    /// Consensus instance the snapshot is about.
    pub eid: ConsensusId,

    /// Regency being negotiated when the snapshot was taken.
    pub regency: Regency,

    /// Last value this replica observed a write quorum for.
    pub quorum_write: TimestampValuePair,

    /// Every (epoch, value) pair this replica ever wrote for the instance.
    pub write_set: BTreeSet<TimestampValuePair>,
}

impl CollectData {
    /// Create a collect snapshot.
    pub fn new(
        sender: ProcessId,
        eid: ConsensusId,
        regency: Regency,
        quorum_write: TimestampValuePair,
        write_set: BTreeSet<TimestampValuePair>,
    ) -> Self {
        Self {
            sender,
            eid,
            regency,
            quorum_write,
            write_set,
        }
    }

    /// The conservative "contributed nothing" snapshot a lagging replica
    /// is rewritten to during normalization.
    pub fn empty(sender: ProcessId, eid: ConsensusId, regency: Regency) -> Self {
        Self::new(
            sender,
            eid,
            regency,
            TimestampValuePair::empty(),
            BTreeSet::new(),
        )
    }

    /// Deterministic bytes signed by the reporting replica.
    ///
    /// Length-prefixed so no field concatenation is ambiguous.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(64);
        msg.extend_from_slice(b"collect:");
        msg.extend_from_slice(&self.sender.0.to_le_bytes());
        msg.extend_from_slice(&self.eid.0.to_le_bytes());
        msg.extend_from_slice(&self.regency.0.to_le_bytes());
        append_pair(&mut msg, &self.quorum_write);
        msg.extend_from_slice(&(self.write_set.len() as u64).to_le_bytes());
        for pair in &self.write_set {
            append_pair(&mut msg, pair);
        }
        msg
    }
}

fn append_pair(msg: &mut Vec<u8>, pair: &TimestampValuePair) {
    msg.extend_from_slice(&pair.timestamp.to_le_bytes());
    msg.extend_from_slice(&(pair.value.len() as u64).to_le_bytes());
    msg.extend_from_slice(&pair.value);
}
