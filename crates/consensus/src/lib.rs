//! The warbft agreement engine.
//!
//! Implements a PBFT-style weak/strong two-phase consensus over opaque
//! byte-string values, tolerating up to F Byzantine replicas out of N.
//!
//! # Architecture
//!
//! - [`Proposer`]: leader side, broadcasts PROPOSE to start an instance
//! - [`Acceptor`]: processes PROPOSE/WEAK/STRONG, escalates votes through
//!   quorum thresholds, and decides
//! - [`ExecutionManager`]: instance registry, out-of-context buffering,
//!   and admission control
//! - [`Execution`]/[`Round`]: per-instance and per-round bookkeeping
//! - [`LeaderChangeManager`]: regency bookkeeping and the
//!   sound/binds/unbound recovery predicates
//!
//! All I/O happens through the `warbft-core` collaborator traits; the
//! engine itself only takes blocking locks. One lock per execution
//! serializes vote processing within an instance while distinct instances
//! proceed concurrently.

mod acceptor;
mod config;
mod execution;
mod leader_change;
mod manager;
mod proposer;
mod round;

pub use acceptor::Acceptor;
pub use config::ConsensusConfig;
pub use execution::Execution;
pub use leader_change::{LeaderChangeManager, LeaderChangePhase};
pub use manager::{AdmissionDecision, ExecutionManager};
pub use proposer::Proposer;
pub use round::Round;

#[cfg(test)]
mod cluster_tests {
    //! Four-replica in-memory cluster exercising the full protocol paths.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;
    use warbft_core::{
        CancelHandle, DecodedBatch, DeliveryNotifier, StateTransferRequester, TimerScheduler,
        TransportBroadcast, ValueValidator,
    };
    use warbft_messages::{CertifiedDecision, ConsensusMessage};
    use warbft_types::{
        hash_value, CollectData, ConsensusId, KeyPair, MacKey, ProcessId, Regency, ReplicaInfo,
        StaticView,
    };

    type Wire = Arc<Mutex<VecDeque<(ProcessId, ConsensusMessage)>>>;

    struct LoopbackTransport {
        wire: Wire,
    }

    impl TransportBroadcast for LoopbackTransport {
        fn send(&self, targets: &[ProcessId], message: ConsensusMessage) {
            let mut wire = self.wire.lock();
            for target in targets {
                wire.push_back((*target, message.clone()));
            }
        }
    }

    struct RecordingNotifier {
        decisions: Mutex<Vec<(ConsensusId, u32, Vec<u8>)>>,
    }

    impl DeliveryNotifier for RecordingNotifier {
        fn on_decided(&self, eid: ConsensusId, round: u32, value: Vec<u8>) {
            self.decisions.lock().push((eid, round, value));
        }
    }

    struct AcceptAll;

    impl ValueValidator for AcceptAll {
        fn check_proposed_value(&self, raw: &[u8], _leader_path: bool) -> Option<DecodedBatch> {
            Some(DecodedBatch {
                requests: vec![raw.to_vec()],
            })
        }
    }

    struct ManualTimers;

    impl TimerScheduler for ManualTimers {
        fn schedule(&self, _eid: ConsensusId, _round: u32, _deadline: Duration) -> CancelHandle {
            CancelHandle::new()
        }
    }

    struct NoStateTransfer;

    impl StateTransferRequester for NoStateTransfer {
        fn request_state_transfer(&self, _from: ProcessId, _eid: ConsensusId) {}
    }

    struct Node {
        id: ProcessId,
        acceptor: Arc<Acceptor>,
        proposer: Proposer,
        manager: Arc<ExecutionManager>,
        leader_change: Arc<LeaderChangeManager>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Node {
        fn decisions(&self) -> Vec<(ConsensusId, u32, Vec<u8>)> {
            self.notifier.decisions.lock().clone()
        }

        /// The collect snapshot this node reports during leader change.
        fn collect(&self, eid: ConsensusId, regency: Regency) -> CollectData {
            match self.manager.execution(eid) {
                Some(execution) => execution.lock().collect(self.id, regency),
                None => CollectData::empty(self.id, eid, regency),
            }
        }

        fn last_cid(&self, eid: ConsensusId) -> CertifiedDecision {
            self.acceptor
                .certified_decision(eid)
                .unwrap_or_else(|| CertifiedDecision::new(self.id, ConsensusId::NONE, Vec::new(), Vec::new()))
        }
    }

    // Pairwise keys derived symmetrically so all views agree on the key
    // shared between i and j.
    fn pairwise_key(a: u64, b: u64) -> MacKey {
        let (lo, hi) = (a.min(b), a.max(b));
        MacKey::new([(lo * 8 + hi + 1) as u8; 32])
    }

    fn make_cluster() -> (Vec<Node>, Wire) {
        let wire: Wire = Arc::new(Mutex::new(VecDeque::new()));
        let keypairs: BTreeMap<u64, KeyPair> = (0..4u64)
            .map(|i| (i, KeyPair::from_seed(&[i as u8 + 1; 32])))
            .collect();

        let nodes = (0..4u64)
            .map(|me| {
                let replicas: Vec<ReplicaInfo> = (0..4u64)
                    .map(|i| ReplicaInfo {
                        process_id: ProcessId(i),
                        public_key: keypairs[&i].public_key(),
                        mac_key: pairwise_key(me, i),
                    })
                    .collect();
                let view = StaticView::new(replicas, 1).unwrap().into_arc();

                let notifier = Arc::new(RecordingNotifier {
                    decisions: Mutex::new(Vec::new()),
                });
                let manager = Arc::new(ExecutionManager::new(view.clone(), notifier.clone(), 100));
                manager.set_last_decided(ConsensusId(9));
                let leader_change = Arc::new(LeaderChangeManager::new(
                    ProcessId(me),
                    view.clone(),
                    keypairs[&me].clone(),
                    ProcessId(0),
                ));
                let transport = Arc::new(LoopbackTransport { wire: wire.clone() });
                let acceptor = Arc::new(Acceptor::new(
                    ProcessId(me),
                    view.clone(),
                    manager.clone(),
                    leader_change.clone(),
                    transport.clone(),
                    Arc::new(AcceptAll),
                    Arc::new(ManualTimers),
                    Arc::new(NoStateTransfer),
                    ConsensusConfig::default(),
                ));
                let proposer = Proposer::new(
                    ProcessId(me),
                    view,
                    transport,
                    Arc::new(AcceptAll),
                    acceptor.clone(),
                );
                Node {
                    id: ProcessId(me),
                    acceptor,
                    proposer,
                    manager,
                    leader_change,
                    notifier,
                }
            })
            .collect();
        (nodes, wire)
    }

    /// Deliver queued messages until the network is quiet.
    fn pump(nodes: &[Node], wire: &Wire) {
        loop {
            let next = wire.lock().pop_front();
            let Some((target, message)) = next else {
                break;
            };
            nodes[target.0 as usize].acceptor.deliver(message);
        }
    }

    const EID: ConsensusId = ConsensusId(10);

    #[traced_test]
    #[test]
    fn test_cluster_decides_happy_path() {
        let (nodes, wire) = make_cluster();

        assert!(nodes[0].proposer.start_execution(EID, b"hello".to_vec()));
        pump(&nodes, &wire);

        for node in &nodes {
            assert_eq!(node.decisions(), vec![(EID, 0, b"hello".to_vec())]);
            assert_eq!(node.manager.last_decided(), EID);
        }
    }

    #[traced_test]
    #[test]
    fn test_cluster_decides_consecutive_instances() {
        let (nodes, wire) = make_cluster();

        assert!(nodes[0].proposer.start_execution(EID, b"first".to_vec()));
        pump(&nodes, &wire);
        assert!(nodes[0].proposer.start_execution(EID.next(), b"second".to_vec()));
        pump(&nodes, &wire);

        for node in &nodes {
            assert_eq!(
                node.decisions(),
                vec![
                    (EID, 0, b"first".to_vec()),
                    (EID.next(), 0, b"second".to_vec()),
                ]
            );
        }
    }

    /// A proposal that reaches the replicas but never completes: the
    /// rounds time out, the group negotiates regency 1, the new leader
    /// finds nothing locked in, and a fresh value decides in round 1.
    #[traced_test]
    #[test]
    fn test_cluster_recovers_through_leader_change() {
        let (nodes, wire) = make_cluster();
        let regency = Regency(1);

        // The leader's PROPOSE reaches only replica 1 before the leader
        // goes quiet; replica 1's WEAK still reaches everyone.
        nodes[1]
            .acceptor
            .deliver(ConsensusMessage::propose(EID, 0, ProcessId(0), b"hello".to_vec()));
        pump(&nodes, &wire);
        for node in &nodes {
            assert!(node.decisions().is_empty());
        }

        // Replicas 1-3 time out and stop; everyone exchanges STOPs.
        for me in [1usize, 2, 3] {
            assert_eq!(nodes[me].acceptor.on_timeout(EID, 0), Some(regency));
        }
        for me in 0..4 {
            for stopper in [1u64, 2, 3] {
                nodes[me].leader_change.add_stop(regency, ProcessId(stopper));
            }
        }

        // The old leader never timed out locally but joins on evidence.
        assert!(nodes[0].leader_change.should_join_stop(regency));
        assert_eq!(nodes[0].acceptor.on_timeout(EID, 0), Some(regency));

        for node in &nodes {
            assert!(node.leader_change.stop_quorum_reached(regency));
            assert!(node.leader_change.start_synchronization(regency));
            assert_eq!(node.leader_change.get_new_leader(), ProcessId(1));
        }

        // Every replica reports its snapshot and last decision to the
        // incoming leader.
        let incoming = &nodes[1];
        for node in &nodes {
            let signed = node.leader_change.sign_collect(node.collect(EID, regency));
            incoming.leader_change.add_collect(regency, signed);
            incoming.leader_change.add_last_cid(regency, node.last_cid(EID));
        }

        let highest = incoming
            .leader_change
            .highest_valid_last_cid(regency)
            .unwrap();
        assert_eq!(highest.eid, ConsensusId::NONE);

        // Nothing reached a write quorum, so the predicates release the
        // new leader to propose freely.
        let collects = incoming.leader_change.select_collects(regency, EID);
        assert_eq!(collects.len(), 4);
        assert!(incoming.leader_change.sound(&collects));
        assert!(incoming.leader_change.unbound(&collects));
        assert_eq!(incoming.leader_change.get_bind_value(&collects), None);
        assert!(incoming.leader_change.begin_resume());

        for node in &nodes {
            node.leader_change.install_regency(regency, ProcessId(1));
        }

        // The new leader re-runs the instance in the next round.
        let retry = ConsensusMessage::propose(EID, 1, ProcessId(1), b"retry".to_vec());
        for node in &nodes {
            node.acceptor.deliver(retry.clone());
        }
        pump(&nodes, &wire);

        for node in &nodes {
            assert_eq!(node.decisions(), vec![(EID, 1, b"retry".to_vec())]);
        }
    }

    /// When a write quorum was reached before the timeout, the binding
    /// value must be recovered and re-proposed, never replaced.
    #[traced_test]
    #[test]
    fn test_cluster_leader_change_recovers_bound_value() {
        let (nodes, wire) = make_cluster();
        let regency = Regency(1);
        let hash = hash_value(b"hello");

        // The full WEAK exchange completes, so every replica records a
        // write quorum, but all STRONG votes are lost before counting.
        for node in &nodes {
            node.acceptor
                .deliver(ConsensusMessage::propose(EID, 0, ProcessId(0), b"hello".to_vec()));
        }
        loop {
            let next = wire.lock().pop_front();
            let Some((target, message)) = next else {
                break;
            };
            if message.kind == warbft_messages::MessageKind::Strong {
                continue;
            }
            nodes[target.0 as usize].acceptor.deliver(message);
        }
        for node in &nodes {
            assert!(node.decisions().is_empty());
            let execution = node.manager.execution(EID).unwrap();
            let execution = execution.lock();
            assert_eq!(execution.quorum_write().value, b"hello".to_vec());
        }
        wire.lock().clear();

        for node in &nodes {
            assert_eq!(node.acceptor.on_timeout(EID, 0), Some(regency));
            assert!(node.leader_change.start_synchronization(regency));
        }

        let incoming = &nodes[1];
        for node in &nodes {
            let signed = node.leader_change.sign_collect(node.collect(EID, regency));
            incoming.leader_change.add_collect(regency, signed);
        }

        let collects = incoming.leader_change.select_collects(regency, EID);
        assert!(incoming.leader_change.sound(&collects));
        assert!(!incoming.leader_change.unbound(&collects));
        assert!(incoming.leader_change.binds(0, &hash, &collects));
        assert_eq!(
            incoming.leader_change.get_bind_value(&collects),
            Some(b"hello".to_vec())
        );

        for node in &nodes {
            node.leader_change.install_regency(regency, ProcessId(1));
        }

        // The recovered value is the one re-proposed and decided.
        let retry = ConsensusMessage::propose(EID, 1, ProcessId(1), b"hello".to_vec());
        for node in &nodes {
            node.acceptor.deliver(retry.clone());
        }
        pump(&nodes, &wire);

        for node in &nodes {
            assert_eq!(node.decisions(), vec![(EID, 1, b"hello".to_vec())]);
        }
    }
}
