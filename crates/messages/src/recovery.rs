//! Leader-change and catch-up artifacts.

use crate::ConsensusMessage;
use serde::{Deserialize, Serialize};
use warbft_types::{CollectData, ConsensusId, ProcessId, PublicKey, Signature};

/// A collect snapshot signed by its reporting replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCollect {
    /// The snapshot.
    pub collect: CollectData,

    /// Signature over `collect.signing_bytes()`.
    pub signature: Signature,
}

impl SignedCollect {
    /// Verify the signature against the claimed sender's key.
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        public_key.verify(&self.collect.signing_bytes(), &self.signature)
    }
}

/// A replica's claimed last decision together with its proof.
///
/// The proof is a set of STRONG messages whose MAC tags attest that a
/// certificate quorum voted for the decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedDecision {
    /// Replica making the claim.
    pub sender: ProcessId,

    /// Instance the decision is for.
    pub eid: ConsensusId,

    /// The decided value (full bytes, not the hash).
    pub value: Vec<u8>,

    /// STRONG messages attesting to the decision.
    pub proof: Vec<ConsensusMessage>,
}

impl CertifiedDecision {
    /// Create a certified decision claim.
    pub fn new(
        sender: ProcessId,
        eid: ConsensusId,
        value: Vec<u8>,
        proof: Vec<ConsensusMessage>,
    ) -> Self {
        Self {
            sender,
            eid,
            value,
            proof,
        }
    }
}
