//! The leader side of the protocol.

use crate::Acceptor;
use std::sync::Arc;
use tracing::{debug, info};
use warbft_core::{TransportBroadcast, ValueValidator};
use warbft_messages::ConsensusMessage;
use warbft_types::{ConsensusId, ProcessId, View};

/// Starts consensus instances when this replica is the leader.
///
/// The proposer never touches execution state directly: its own PROPOSE
/// goes through the acceptor like everyone else's, so the leader votes
/// and decides by exactly the same path as its followers.
pub struct Proposer {
    me: ProcessId,
    view: Arc<dyn View>,
    transport: Arc<dyn TransportBroadcast>,
    validator: Arc<dyn ValueValidator>,
    acceptor: Arc<Acceptor>,
}

impl Proposer {
    /// Wire up a proposer.
    pub fn new(
        me: ProcessId,
        view: Arc<dyn View>,
        transport: Arc<dyn TransportBroadcast>,
        validator: Arc<dyn ValueValidator>,
        acceptor: Arc<Acceptor>,
    ) -> Self {
        Self {
            me,
            view,
            transport,
            validator,
            acceptor,
        }
    }

    /// Start instance `eid` by proposing `value` in round 0.
    ///
    /// Returns false when the value fails leader-side validation, in
    /// which case nothing is sent.
    pub fn start_execution(&self, eid: ConsensusId, value: Vec<u8>) -> bool {
        if self.validator.check_proposed_value(&value, true).is_none() {
            debug!(eid = eid.0, "Refusing to propose a value that fails validation");
            return false;
        }

        info!(eid = eid.0, bytes = value.len(), "Proposing");
        let message = ConsensusMessage::propose(eid, 0, self.me, value);

        let others: Vec<ProcessId> = self
            .view
            .processes()
            .iter()
            .copied()
            .filter(|p| *p != self.me)
            .collect();
        self.transport.send(&others, message.clone());
        self.acceptor.deliver(message);
        true
    }
}
