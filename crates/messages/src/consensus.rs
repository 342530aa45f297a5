//! PROPOSE/WEAK/STRONG consensus messages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use warbft_types::{ConsensusId, MacTag, ProcessId};

/// Consensus message discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Leader's proposal carrying the full value.
    Propose,
    /// First-phase vote carrying the hash of the proposed value.
    Weak,
    /// Second-phase vote carrying the hash of the proposed value, plus a
    /// per-peer MAC proof vector.
    Strong,
}

impl MessageKind {
    fn discriminant(self) -> u8 {
        match self {
            MessageKind::Propose => 0,
            MessageKind::Weak => 1,
            MessageKind::Strong => 2,
        }
    }
}

/// A consensus message for one (instance, round).
///
/// PROPOSE carries the full proposed value; WEAK and STRONG carry the hash
/// bytes of that value. STRONG additionally carries a MAC tag for every
/// acceptor in the view, forming the decision proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    /// Consensus instance id.
    pub eid: ConsensusId,

    /// Round number within the instance.
    pub round: u32,

    /// Message kind.
    pub kind: MessageKind,

    /// Originating replica.
    pub sender: ProcessId,

    /// Value bytes (full value for PROPOSE, value hash for votes).
    pub value: Vec<u8>,

    /// Per-acceptor MAC tags over the canonical bytes (STRONG only).
    pub proof: Option<BTreeMap<ProcessId, MacTag>>,
}

impl ConsensusMessage {
    /// Create a PROPOSE message.
    pub fn propose(eid: ConsensusId, round: u32, sender: ProcessId, value: Vec<u8>) -> Self {
        Self {
            eid,
            round,
            kind: MessageKind::Propose,
            sender,
            value,
            proof: None,
        }
    }

    /// Create a WEAK vote.
    pub fn weak(eid: ConsensusId, round: u32, sender: ProcessId, value_hash: Vec<u8>) -> Self {
        Self {
            eid,
            round,
            kind: MessageKind::Weak,
            sender,
            value: value_hash,
            proof: None,
        }
    }

    /// Create a STRONG vote (proof vector attached separately).
    pub fn strong(eid: ConsensusId, round: u32, sender: ProcessId, value_hash: Vec<u8>) -> Self {
        Self {
            eid,
            round,
            kind: MessageKind::Strong,
            sender,
            value: value_hash,
            proof: None,
        }
    }

    /// Attach a MAC proof vector.
    pub fn with_proof(mut self, proof: BTreeMap<ProcessId, MacTag>) -> Self {
        self.proof = Some(proof);
        self
    }

    /// Deterministic bytes covered by MAC tags and signatures.
    ///
    /// Excludes the proof vector itself so every acceptor's tag covers the
    /// same input.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(40 + self.value.len());
        msg.extend_from_slice(b"consensus:");
        msg.extend_from_slice(&self.eid.0.to_le_bytes());
        msg.extend_from_slice(&self.round.to_le_bytes());
        msg.push(self.kind.discriminant());
        msg.extend_from_slice(&self.sender.0.to_le_bytes());
        msg.extend_from_slice(&(self.value.len() as u64).to_le_bytes());
        msg.extend_from_slice(&self.value);
        msg
    }
}

impl fmt::Display for ConsensusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} from {} for ({}, round {})",
            self.kind, self.sender, self.eid, self.round
        )
    }
}
