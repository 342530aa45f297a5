//! Execution registry, out-of-context buffering, and admission control.

use crate::Execution;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;
use warbft_core::DeliveryNotifier;
use warbft_messages::{ConsensusMessage, MessageKind};
use warbft_types::{ConsensusId, View};

/// Verdict of the admission gate for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// In context: process now under the instance lock.
    Process,
    /// Out of context: buffer until the instance comes into range.
    Buffer,
    /// At or below the last decided instance; useful only for proof
    /// completeness.
    Stale,
    /// Too far ahead to buffer; ask the sender for state transfer.
    RequestStateTransfer,
}

/// Registry of live executions plus the out-of-context message buffers.
///
/// This is the sole admission gate bounding memory growth from
/// out-of-order or malicious traffic. The registry lock and the buffer
/// locks are independent of the per-execution locks, so registering a new
/// instance never blocks vote processing on other instances.
pub struct ExecutionManager {
    view: Arc<dyn View>,
    notifier: Arc<dyn DeliveryNotifier>,
    high_mark: i64,
    executions: Mutex<HashMap<i64, Arc<Mutex<Execution>>>>,
    out_of_context: Mutex<IndexMap<i64, Vec<ConsensusMessage>>>,
    out_of_context_proposes: Mutex<HashMap<i64, ConsensusMessage>>,
    last_decided: AtomicI64,
    in_execution: AtomicI64,
    retrieving_state: AtomicBool,
}

impl ExecutionManager {
    const NOT_IN_EXECUTION: i64 = -1;

    /// Create a manager for a view, delivering decisions to `notifier`.
    pub fn new(view: Arc<dyn View>, notifier: Arc<dyn DeliveryNotifier>, high_mark: i64) -> Self {
        Self {
            view,
            notifier,
            high_mark,
            executions: Mutex::new(HashMap::new()),
            out_of_context: Mutex::new(IndexMap::new()),
            out_of_context_proposes: Mutex::new(HashMap::new()),
            last_decided: AtomicI64::new(ConsensusId::NONE.0),
            in_execution: AtomicI64::new(Self::NOT_IN_EXECUTION),
            retrieving_state: AtomicBool::new(false),
        }
    }

    /// Classify an inbound message against the admission rules.
    pub fn check_admission(&self, message: &ConsensusMessage) -> AdmissionDecision {
        if self.retrieving_state.load(Ordering::Acquire) {
            return AdmissionDecision::Buffer;
        }

        let last = self.last_decided.load(Ordering::Acquire);
        let eid = message.eid.0;

        if eid <= last {
            AdmissionDecision::Stale
        } else if eid < last + self.high_mark {
            if eid == last + 1 {
                AdmissionDecision::Process
            } else {
                AdmissionDecision::Buffer
            }
        } else {
            AdmissionDecision::RequestStateTransfer
        }
    }

    /// Buffer an out-of-context message for later replay.
    ///
    /// A PROPOSE goes into its own slot (first one per instance wins) so
    /// replay can apply it before any buffered votes.
    pub fn buffer_out_of_context(&self, message: ConsensusMessage) {
        let eid = message.eid.0;
        match message.kind {
            MessageKind::Propose => {
                self.out_of_context_proposes
                    .lock()
                    .entry(eid)
                    .or_insert(message);
            }
            _ => {
                self.out_of_context
                    .lock()
                    .entry(eid)
                    .or_default()
                    .push(message);
            }
        }
    }

    /// Look up a live execution.
    pub fn execution(&self, eid: ConsensusId) -> Option<Arc<Mutex<Execution>>> {
        self.executions.lock().get(&eid.0).cloned()
    }

    /// Get or create the execution for `eid`.
    ///
    /// On creation the buffered out-of-context backlog for the instance is
    /// drained and returned (PROPOSE first, then votes in arrival order);
    /// the caller replays it under the instance lock, stopping early if
    /// the instance decides mid-replay.
    pub fn get_or_create_execution(
        &self,
        eid: ConsensusId,
    ) -> (Arc<Mutex<Execution>>, Vec<ConsensusMessage>) {
        let (execution, created) = {
            let mut executions = self.executions.lock();
            match executions.get(&eid.0) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let execution = Arc::new(Mutex::new(Execution::new(
                        eid,
                        self.view.n(),
                        self.notifier.clone(),
                    )));
                    executions.insert(eid.0, execution.clone());
                    (execution, true)
                }
            }
        };

        if !created {
            return (execution, Vec::new());
        }

        let mut backlog = Vec::new();
        if let Some(propose) = self.out_of_context_proposes.lock().remove(&eid.0) {
            backlog.push(propose);
        }
        if let Some(votes) = self.out_of_context.lock().shift_remove(&eid.0) {
            backlog.extend(votes);
        }
        if !backlog.is_empty() {
            debug!(
                eid = eid.0,
                buffered = backlog.len(),
                "Draining out-of-context backlog"
            );
        }
        (execution, backlog)
    }

    /// Record that `eid` decided, advancing the admission window.
    pub fn decided(&self, eid: ConsensusId) {
        self.last_decided.fetch_max(eid.0, Ordering::AcqRel);
        let _ = self.in_execution.compare_exchange(
            eid.0,
            Self::NOT_IN_EXECUTION,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Highest decided instance id.
    pub fn last_decided(&self) -> ConsensusId {
        ConsensusId(self.last_decided.load(Ordering::Acquire))
    }

    /// Force the last-decided watermark (state-transfer install path).
    pub fn set_last_decided(&self, eid: ConsensusId) {
        self.last_decided.store(eid.0, Ordering::Release);
    }

    /// Mark an instance as optimistically started.
    pub fn set_in_execution(&self, eid: ConsensusId) {
        self.in_execution.store(eid.0, Ordering::Release);
    }

    /// The instance currently marked in execution, if any.
    pub fn in_execution(&self) -> Option<ConsensusId> {
        match self.in_execution.load(Ordering::Acquire) {
            Self::NOT_IN_EXECUTION => None,
            eid => Some(ConsensusId(eid)),
        }
    }

    /// Toggle the "state transfer in progress" admission mode, during
    /// which every inbound message is buffered.
    pub fn set_retrieving_state(&self, retrieving: bool) {
        self.retrieving_state.store(retrieving, Ordering::Release);
    }

    /// Whether state transfer is in progress.
    pub fn is_retrieving_state(&self) -> bool {
        self.retrieving_state.load(Ordering::Acquire)
    }

    /// Garbage-collect executions and buffers for all instances `<= eid`.
    pub fn remove_executions_up_to(&self, eid: ConsensusId) {
        self.executions.lock().retain(|id, _| *id > eid.0);
        self.out_of_context.lock().retain(|id, _| *id > eid.0);
        self.out_of_context_proposes
            .lock()
            .retain(|id, _| *id > eid.0);
        debug!(up_to = eid.0, "Removed executions");
    }

    /// Number of instances with buffered out-of-context votes (tests and
    /// diagnostics).
    pub fn out_of_context_len(&self) -> usize {
        self.out_of_context.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warbft_types::{KeyPair, MacKey, ProcessId, ReplicaInfo, StaticView};

    struct NullNotifier;

    impl DeliveryNotifier for NullNotifier {
        fn on_decided(&self, _eid: ConsensusId, _round: u32, _value: Vec<u8>) {}
    }

    fn make_manager(high_mark: i64) -> ExecutionManager {
        let replicas: Vec<ReplicaInfo> = (0..4)
            .map(|i| ReplicaInfo {
                process_id: ProcessId(i),
                public_key: KeyPair::from_seed(&[i as u8; 32]).public_key(),
                mac_key: MacKey::new([i as u8; 32]),
            })
            .collect();
        let view = StaticView::new(replicas, 1).unwrap().into_arc();
        ExecutionManager::new(view, Arc::new(NullNotifier), high_mark)
    }

    fn vote(eid: i64) -> ConsensusMessage {
        ConsensusMessage::weak(ConsensusId(eid), 0, ProcessId(1), b"h".to_vec())
    }

    #[test]
    fn test_admission_boundary() {
        let manager = make_manager(10);
        manager.set_last_decided(ConsensusId(5));

        assert_eq!(
            manager.check_admission(&vote(6)),
            AdmissionDecision::Process
        );
        assert_eq!(manager.check_admission(&vote(7)), AdmissionDecision::Buffer);
        assert_eq!(
            manager.check_admission(&vote(14)),
            AdmissionDecision::Buffer
        );
        assert_eq!(
            manager.check_admission(&vote(15)),
            AdmissionDecision::RequestStateTransfer
        );
        assert_eq!(
            manager.check_admission(&vote(100)),
            AdmissionDecision::RequestStateTransfer
        );
        assert_eq!(manager.check_admission(&vote(5)), AdmissionDecision::Stale);
        assert_eq!(manager.check_admission(&vote(0)), AdmissionDecision::Stale);
    }

    #[test]
    fn test_retrieving_state_buffers_everything() {
        let manager = make_manager(10);
        manager.set_last_decided(ConsensusId(5));
        manager.set_retrieving_state(true);

        assert_eq!(manager.check_admission(&vote(6)), AdmissionDecision::Buffer);
        assert_eq!(manager.check_admission(&vote(1)), AdmissionDecision::Buffer);

        manager.set_retrieving_state(false);
        assert_eq!(
            manager.check_admission(&vote(6)),
            AdmissionDecision::Process
        );
    }

    #[test]
    fn test_backlog_drained_propose_first() {
        let manager = make_manager(10);

        manager.buffer_out_of_context(vote(3));
        manager.buffer_out_of_context(ConsensusMessage::propose(
            ConsensusId(3),
            0,
            ProcessId(0),
            b"value".to_vec(),
        ));
        manager.buffer_out_of_context(vote(3));

        let (_, backlog) = manager.get_or_create_execution(ConsensusId(3));
        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog[0].kind, MessageKind::Propose);

        // Second lookup finds the existing execution with nothing to drain.
        let (_, backlog) = manager.get_or_create_execution(ConsensusId(3));
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_decided_advances_watermark() {
        let manager = make_manager(10);
        manager.set_in_execution(ConsensusId(0));

        manager.decided(ConsensusId(0));
        assert_eq!(manager.last_decided(), ConsensusId(0));
        assert_eq!(manager.in_execution(), None);

        // Watermark never regresses.
        manager.decided(ConsensusId(4));
        manager.decided(ConsensusId(2));
        assert_eq!(manager.last_decided(), ConsensusId(4));
    }

    #[test]
    fn test_remove_executions_up_to() {
        let manager = make_manager(10);
        for eid in 0..5 {
            manager.get_or_create_execution(ConsensusId(eid));
        }
        manager.buffer_out_of_context(vote(2));
        manager.buffer_out_of_context(vote(4));

        manager.remove_executions_up_to(ConsensusId(2));

        assert!(manager.execution(ConsensusId(2)).is_none());
        assert!(manager.execution(ConsensusId(3)).is_some());
        assert_eq!(manager.out_of_context_len(), 1);
    }
}
