//! Core types for the warbft agreement engine.
//!
//! Everything here is protocol-layer data: identifiers, the blake3 hash
//! wrapper, signing/MAC primitives, the quorum oracle ([`View`]) and the
//! leader-change collect structures. No I/O, no locking.

mod collect;
mod crypto;
mod hash;
mod identifiers;
mod view;

pub use collect::{hash_value, CollectData, TimestampValuePair};
pub use crypto::{KeyPair, MacKey, MacTag, PublicKey, Signature, SignatureError};
pub use hash::{Hash, HexError};
pub use identifiers::{ConsensusId, ProcessId, Regency};
pub use view::{ReplicaInfo, StaticView, View, ViewError};
