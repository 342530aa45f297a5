//! Collaborator traits at the engine boundary.

use warbft_messages::ConsensusMessage;
use warbft_types::{ConsensusId, ProcessId};

/// A proposed value decoded into its constituent client requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    /// The opaque client requests carried by the proposal.
    pub requests: Vec<Vec<u8>>,
}

/// Application hook validating and decoding a proposed value.
///
/// Called by the acceptor before it casts any vote for a proposal.
/// Returning `None` rejects the proposal: the acceptor logs the rejection
/// and casts no vote, which is indistinguishable from never having
/// received the PROPOSE. A Byzantine leader therefore cannot force a
/// correct replica to vote for garbage.
pub trait ValueValidator: Send + Sync {
    /// Validate and decode a proposed value.
    ///
    /// `leader_path` is true when the local replica is validating its own
    /// proposal before broadcasting it.
    fn check_proposed_value(&self, raw: &[u8], leader_path: bool) -> Option<DecodedBatch>;
}

/// Upper delivery layer notified of decisions.
///
/// # Guarantees
///
/// - Called exactly once per consensus instance, from the idempotent
///   terminal transition of that instance's `Execution`.
/// - Called while the instance lock is held; implementations must not
///   re-enter the engine for the same instance.
pub trait DeliveryNotifier: Send + Sync {
    /// A value was decided for `eid` in `round`.
    fn on_decided(&self, eid: ConsensusId, round: u32, value: Vec<u8>);
}

/// Point-to-point transport used to disseminate consensus messages.
///
/// Implementations own framing, authentication, and reconnection. The
/// engine assumes sends are best-effort and never blocks on delivery
/// acknowledgement.
pub trait TransportBroadcast: Send + Sync {
    /// Send a message to each of the given targets.
    fn send(&self, targets: &[ProcessId], message: ConsensusMessage);

    /// Send a message to a single target.
    fn send_one(&self, target: ProcessId, message: ConsensusMessage) {
        self.send(std::slice::from_ref(&target), message);
    }
}

/// Hook for requesting state transfer from a peer.
///
/// Invoked when admission control sees a message so far ahead of the local
/// last-decided instance that buffering it would be unbounded; the sender
/// evidently has state this replica lacks.
pub trait StateTransferRequester: Send + Sync {
    /// Ask `from` for the state needed to catch up to `eid`.
    fn request_state_transfer(&self, from: ProcessId, eid: ConsensusId);
}
