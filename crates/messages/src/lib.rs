//! Logical message types exchanged by warbft replicas.
//!
//! Wire framing (length prefixes, transport MACs, reconnection) belongs to
//! the transport layer; these types carry only the fields the agreement
//! engine reasons about.

mod consensus;
mod recovery;

pub use consensus::{ConsensusMessage, MessageKind};
pub use recovery::{CertifiedDecision, SignedCollect};
