//! The protocol state machine processing PROPOSE/WEAK/STRONG messages.

use crate::{ConsensusConfig, Execution, ExecutionManager, LeaderChangeManager};
use crate::manager::AdmissionDecision;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use warbft_core::{
    StateTransferRequester, TimerScheduler, TransportBroadcast, ValueValidator,
};
use warbft_messages::{CertifiedDecision, ConsensusMessage, MessageKind};
use warbft_types::{hash_value, ConsensusId, MacTag, ProcessId, Regency, View};

/// Per-replica acceptor role.
///
/// All inbound consensus traffic enters through [`deliver`](Self::deliver).
/// Message processing for one instance is serialized by that instance's
/// lock; distinct instances proceed concurrently. Byzantine input is
/// logged and dropped, never surfaced as an error; a faulty sender must
/// not be able to crash a correct replica.
pub struct Acceptor {
    me: ProcessId,
    view: Arc<dyn View>,
    manager: Arc<ExecutionManager>,
    leader_change: Arc<LeaderChangeManager>,
    transport: Arc<dyn TransportBroadcast>,
    validator: Arc<dyn ValueValidator>,
    timers: Arc<dyn TimerScheduler>,
    state_transfer: Arc<dyn StateTransferRequester>,
    config: ConsensusConfig,
}

impl Acceptor {
    /// Wire up an acceptor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        me: ProcessId,
        view: Arc<dyn View>,
        manager: Arc<ExecutionManager>,
        leader_change: Arc<LeaderChangeManager>,
        transport: Arc<dyn TransportBroadcast>,
        validator: Arc<dyn ValueValidator>,
        timers: Arc<dyn TimerScheduler>,
        state_transfer: Arc<dyn StateTransferRequester>,
        config: ConsensusConfig,
    ) -> Self {
        Self {
            me,
            view,
            manager,
            leader_change,
            transport,
            validator,
            timers,
            state_transfer,
            config,
        }
    }

    /// The local process id.
    pub fn process_id(&self) -> ProcessId {
        self.me
    }

    /// Entry point for all inbound PROPOSE/WEAK/STRONG traffic.
    pub fn deliver(&self, message: ConsensusMessage) {
        if !self.view.contains(message.sender) {
            warn!(sender = message.sender.0, "Message from unknown process");
            return;
        }

        match self.manager.check_admission(&message) {
            AdmissionDecision::Process => self.process(message),
            AdmissionDecision::Buffer => {
                debug!(eid = message.eid.0, "Buffering out-of-context message");
                self.manager.buffer_out_of_context(message);
            }
            AdmissionDecision::Stale => {
                // Votes for already-decided instances still complete the
                // decision proof while the execution is live.
                if let Some(execution) = self.manager.execution(message.eid) {
                    let mut execution = execution.lock();
                    self.handle(&mut execution, message);
                } else {
                    debug!(eid = message.eid.0, "Dropping stale message");
                }
            }
            AdmissionDecision::RequestStateTransfer => {
                info!(
                    eid = message.eid.0,
                    sender = message.sender.0,
                    "Message beyond high-water mark, requesting state transfer"
                );
                self.state_transfer
                    .request_state_transfer(message.sender, message.eid);
            }
        }
    }

    /// Process an in-context message, replaying any out-of-context backlog
    /// drained by instance creation first.
    fn process(&self, message: ConsensusMessage) {
        let (execution, backlog) = self.manager.get_or_create_execution(message.eid);
        let mut execution = execution.lock();

        for buffered in backlog {
            if execution.is_decided() {
                break;
            }
            self.handle(&mut execution, buffered);
        }
        self.handle(&mut execution, message);
    }

    fn handle(&self, execution: &mut Execution, message: ConsensusMessage) {
        match message.kind {
            MessageKind::Propose => self.on_propose(execution, message),
            MessageKind::Weak => self.on_weak(execution, message),
            MessageKind::Strong => self.on_strong(execution, message),
        }
    }

    /// Handle the leader's proposal.
    fn on_propose(&self, execution: &mut Execution, message: ConsensusMessage) {
        let leader = self.leader_change.leader();
        if message.sender != leader {
            debug!(
                sender = message.sender.0,
                leader = leader.0,
                eid = message.eid.0,
                "PROPOSE from non-leader ignored"
            );
            return;
        }
        let Some(my_pos) = self.view.position_of(self.me) else {
            return;
        };

        let eid = execution.eid();
        let round_number = message.round;
        let value = message.value;
        let hash = hash_value(&value);

        {
            let Some(round) = self.round_with_timer(execution, round_number) else {
                return;
            };
            if round.is_frozen() {
                debug!(eid = eid.0, round = round_number, "PROPOSE for frozen round");
                return;
            }
            if !round.set_proposed(value.clone(), hash.clone()) {
                debug!(eid = eid.0, round = round_number, "Duplicate PROPOSE ignored");
                return;
            }
        }

        // Optimistic early start for the instance right after the last
        // decided one.
        if eid == self.manager.last_decided().next() {
            self.manager.set_in_execution(eid);
        }

        if self
            .validator
            .check_proposed_value(&value, false)
            .is_none()
        {
            info!(eid = eid.0, sender = message.sender.0, "Proposed value rejected");
            return;
        }

        debug!(eid = eid.0, round = round_number, bytes = value.len(), "Accepted PROPOSE");

        if self.view.is_bft() {
            execution.add_written(value.clone());
            if let Some(round) = execution.round_mut(round_number, false) {
                round.set_weak(my_pos, hash.clone());
            }
            self.broadcast_to_others(ConsensusMessage::weak(
                eid,
                round_number,
                self.me,
                hash.clone(),
            ));

            // A strong vote inherited from an earlier round of this
            // instance may match the re-proposed value. The vote itself is
            // set-once, but it must be re-announced under this round so
            // peers whose copy was lost can rebuild the certificate.
            let inherited = execution
                .round(round_number)
                .and_then(|r| r.strong_vote(my_pos))
                .is_some_and(|v| v == hash.as_slice());
            if inherited {
                let strong = ConsensusMessage::strong(eid, round_number, self.me, hash.clone());
                let proof = self.mac_proof(&strong);
                let strong = strong.with_proof(proof);
                if let Some(round) = execution.round_mut(round_number, false) {
                    round.add_proof(my_pos, strong.clone());
                }
                self.broadcast_to_others(strong);
                self.compute_strong(execution, round_number, &hash);
            } else {
                self.compute_weak(execution, round_number, &hash);
            }
        } else {
            // Crash-fault-only mode skips the WEAK phase entirely.
            execution.set_quorum_write(value.clone());
            if let Some(round) = execution.round_mut(round_number, false) {
                round.set_strong(my_pos, hash.clone());
            }
            self.broadcast_to_others(ConsensusMessage::strong(
                eid,
                round_number,
                self.me,
                hash.clone(),
            ));
            self.compute_strong(execution, round_number, &hash);
        }
    }

    /// Handle a peer's WEAK vote.
    fn on_weak(&self, execution: &mut Execution, message: ConsensusMessage) {
        let Some(pos) = self.view.position_of(message.sender) else {
            return;
        };

        let value = message.value;
        if let Some(round) = self.round_with_timer(execution, message.round) {
            round.set_weak(pos, value.clone());
        }
        self.compute_weak(execution, message.round, &value);
    }

    /// Escalate to STRONG once a weak quorum matches the local proposal.
    fn compute_weak(&self, execution: &mut Execution, round_number: u32, value: &[u8]) {
        let Some(my_pos) = self.view.position_of(self.me) else {
            return;
        };

        let (count, matches_proposal, already_strong, frozen) = {
            let Some(round) = execution.round(round_number) else {
                return;
            };
            (
                round.count_weak(value),
                round.proposed_hash() == Some(value),
                round.is_strong_set(my_pos),
                round.is_frozen(),
            )
        };

        if frozen || already_strong || count < self.view.strong_quorum() || !matches_proposal {
            return;
        }

        // The proposed value reached a weak quorum: record the write-quorum
        // observation for leader change, then cast our STRONG vote.
        let Some(proposed) = execution
            .round(round_number)
            .and_then(|r| r.proposed_value())
            .map(<[u8]>::to_vec)
        else {
            return;
        };
        execution.set_quorum_write(proposed);

        let eid = execution.eid();
        let strong = ConsensusMessage::strong(eid, round_number, self.me, value.to_vec());
        let proof = self.mac_proof(&strong);
        let strong = strong.with_proof(proof);

        if let Some(round) = execution.round_mut(round_number, false) {
            round.set_strong(my_pos, value.to_vec());
            round.add_proof(my_pos, strong.clone());
        }

        debug!(
            eid = eid.0,
            round = round_number,
            weak_votes = count,
            "Weak quorum reached, broadcasting STRONG"
        );
        self.broadcast_to_others(strong);
        self.compute_strong(execution, round_number, value);
    }

    /// Handle a peer's STRONG vote.
    fn on_strong(&self, execution: &mut Execution, message: ConsensusMessage) {
        let Some(pos) = self.view.position_of(message.sender) else {
            return;
        };

        if message.sender != self.me && !self.verify_strong_proof(&message) {
            return;
        }

        let round_number = message.round;
        let value = message.value.clone();
        if let Some(round) = self.round_with_timer(execution, round_number) {
            round.set_strong(pos, value.clone());
            round.add_proof(pos, message);
        }
        self.compute_strong(execution, round_number, &value);
    }

    /// Decide once a certificate quorum of STRONG votes matches the local
    /// proposal.
    fn compute_strong(&self, execution: &mut Execution, round_number: u32, value: &[u8]) {
        if execution.is_decided() {
            return;
        }

        let (count, matches_proposal) = {
            let Some(round) = execution.round(round_number) else {
                return;
            };
            (
                round.count_strong(value),
                round.proposed_hash() == Some(value),
            )
        };

        if count >= self.view.certificate_quorum() && matches_proposal {
            self.decide(execution, round_number);
        }
    }

    /// Terminal transition for an instance.
    fn decide(&self, execution: &mut Execution, round_number: u32) {
        let eid = execution.eid();
        let value = {
            let Some(round) = execution.round_mut(round_number, false) else {
                return;
            };
            round.cancel_timer();
            let Some(value) = round.proposed_value().map(<[u8]>::to_vec) else {
                return;
            };
            value
        };

        info!(eid = eid.0, round = round_number, "Strong quorum reached, deciding");
        if execution.decided(round_number, value) {
            self.manager.decided(eid);
        }
    }

    /// Round timer expiry: freeze the round and initiate leader change.
    ///
    /// The protocol never retries a frozen round locally; recovery goes
    /// through the regency change. Returns the regency to negotiate when
    /// this timeout transitions the replica out of normal phase.
    pub fn on_timeout(&self, eid: ConsensusId, round_number: u32) -> Option<Regency> {
        let execution = self.manager.execution(eid)?;
        {
            let mut execution = execution.lock();
            if execution.is_decided() {
                return None;
            }
            let round = execution.round_mut(round_number, false)?;
            if round.is_frozen() {
                return None;
            }
            round.freeze();
        }

        warn!(eid = eid.0, round = round_number, "Round timed out, freezing");
        self.leader_change.on_round_timeout()
    }

    /// Assemble a certified decision for a decided instance, for the
    /// catch-up layer to answer peers with.
    pub fn certified_decision(&self, eid: ConsensusId) -> Option<CertifiedDecision> {
        let execution = self.manager.execution(eid)?;
        let execution = execution.lock();
        let round_number = execution.decision_round()?;
        let round = execution.round(round_number)?;
        let value = round.proposed_value()?.to_vec();
        Some(CertifiedDecision::new(self.me, eid, value, round.proofs()))
    }

    /// Verify the MAC tag addressed to this replica on a STRONG message.
    fn verify_strong_proof(&self, message: &ConsensusMessage) -> bool {
        let Some(proof) = &message.proof else {
            if self.view.is_bft() {
                warn!(sender = message.sender.0, "STRONG without proof vector");
                return false;
            }
            return true;
        };
        let Some(tag) = proof.get(&self.me) else {
            warn!(sender = message.sender.0, "STRONG proof missing our tag");
            return false;
        };
        let Some(key) = self.view.mac_key(message.sender) else {
            return false;
        };
        if !key.verify(&message.canonical_bytes(), tag) {
            warn!(sender = message.sender.0, "STRONG proof tag mismatch");
            return false;
        }
        true
    }

    /// Build the per-acceptor MAC proof vector for a STRONG message.
    fn mac_proof(&self, message: &ConsensusMessage) -> BTreeMap<ProcessId, MacTag> {
        let canonical = message.canonical_bytes();
        let mut proof = BTreeMap::new();
        for process in self.view.processes() {
            if let Some(key) = self.view.mac_key(*process) {
                proof.insert(*process, key.tag(&canonical));
            }
        }
        proof
    }

    /// Materialize a round and make sure its deadline timer is armed.
    fn round_with_timer<'a>(
        &self,
        execution: &'a mut Execution,
        round_number: u32,
    ) -> Option<&'a mut crate::Round> {
        let eid = execution.eid();
        let decided = execution.is_decided();
        let round = execution.round_mut(round_number, true)?;
        if !decided && !round.is_frozen() && !round.has_timer() {
            round.set_timer(
                self.timers
                    .schedule(eid, round_number, self.config.round_timeout),
            );
        }
        Some(round)
    }

    fn broadcast_to_others(&self, message: ConsensusMessage) {
        let targets: Vec<ProcessId> = self
            .view
            .processes()
            .iter()
            .copied()
            .filter(|p| *p != self.me)
            .collect();
        self.transport.send(&targets, message);
    }
}
