//! Per-instance consensus container.

use crate::Round;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use warbft_core::DeliveryNotifier;
use warbft_types::{CollectData, ConsensusId, Regency, TimestampValuePair};

/// All state owned by one consensus instance: the rounds tried for it,
/// the decision flag, and the leader-change write bookkeeping.
///
/// An `Execution` is always reached through its owning manager's
/// `Arc<Mutex<Execution>>`; that single lock serializes every vote applied
/// to the instance.
pub struct Execution {
    eid: ConsensusId,
    n: usize,
    rounds: BTreeMap<u32, Round>,
    decided: bool,
    decision_round: Option<u32>,
    decision_time: Option<Instant>,
    epoch: u64,
    quorum_write: TimestampValuePair,
    write_set: BTreeSet<TimestampValuePair>,
    notifier: Arc<dyn DeliveryNotifier>,
}

impl Execution {
    /// Create the container for instance `eid` in a view of `n` acceptors.
    pub fn new(eid: ConsensusId, n: usize, notifier: Arc<dyn DeliveryNotifier>) -> Self {
        Self {
            eid,
            n,
            rounds: BTreeMap::new(),
            decided: false,
            decision_round: None,
            decision_time: None,
            epoch: 0,
            quorum_write: TimestampValuePair::empty(),
            write_set: BTreeSet::new(),
            notifier,
        }
    }

    /// The instance id.
    pub fn eid(&self) -> ConsensusId {
        self.eid
    }

    /// Look up a round without creating it.
    pub fn round(&self, number: u32) -> Option<&Round> {
        self.rounds.get(&number)
    }

    /// Look up a round, optionally creating it.
    ///
    /// A created round inherits the vote arrays of the highest existing
    /// round below it, so escalating votes are never lost across a bump.
    pub fn round_mut(&mut self, number: u32, create: bool) -> Option<&mut Round> {
        if !self.rounds.contains_key(&number) {
            if !create {
                return None;
            }
            let round = match self.rounds.range(..number).next_back() {
                Some((_, previous)) => Round::inheriting(number, previous),
                None => Round::new(number, self.n),
            };
            debug!(eid = self.eid.0, round = number, "Created round");
            self.rounds.insert(number, round);
        }
        self.rounds.get_mut(&number)
    }

    /// Allocate the round after the highest existing one.
    pub fn create_next_round(&mut self) -> &mut Round {
        let number = self
            .rounds
            .keys()
            .next_back()
            .map(|k| k + 1)
            .unwrap_or_default();
        self.round_mut(number, true)
            .expect("round should exist after creation")
    }

    /// Highest round number tried so far, if any.
    pub fn last_round_number(&self) -> Option<u32> {
        self.rounds.keys().next_back().copied()
    }

    /// Terminal transition: record the decision and notify the delivery
    /// layer.
    ///
    /// Idempotent; only the first call per instance flips the flag and
    /// notifies; all later calls are no-ops regardless of round or value.
    /// This is the sole path by which a value becomes externally visible.
    pub fn decided(&mut self, round: u32, value: Vec<u8>) -> bool {
        if self.decided {
            debug!(eid = self.eid.0, "Duplicate decision ignored");
            return false;
        }
        self.decided = true;
        self.decision_round = Some(round);
        self.decision_time = Some(Instant::now());

        info!(eid = self.eid.0, round = round, "Instance decided");
        self.notifier.on_decided(self.eid, round, value);
        true
    }

    /// Whether the instance has decided.
    pub fn is_decided(&self) -> bool {
        self.decided
    }

    /// The round the decision fired in.
    pub fn decision_round(&self) -> Option<u32> {
        self.decision_round
    }

    /// When the decision fired (local clock).
    pub fn decision_time(&self) -> Option<Instant> {
        self.decision_time
    }

    /// Discard all rounds above `limit`, cancelling their timers.
    pub fn remove_rounds(&mut self, limit: u32) {
        let removed: Vec<u32> = self.rounds.range(limit + 1..).map(|(k, _)| *k).collect();
        for number in removed {
            if let Some(mut round) = self.rounds.remove(&number) {
                round.mark_removed();
                debug!(eid = self.eid.0, round = number, "Removed round");
            }
        }
    }

    // Leader-change bookkeeping

    /// Current write epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Bump the epoch used to timestamp subsequent writes.
    pub fn inc_epoch(&mut self) {
        self.epoch += 1;
    }

    /// Append `(current epoch, value)` to the write-set.
    pub fn add_written(&mut self, value: Vec<u8>) {
        self.write_set
            .insert(TimestampValuePair::new(self.epoch, value));
    }

    /// Record `(current epoch, value)` as the latest observed write
    /// quorum.
    pub fn set_quorum_write(&mut self, value: Vec<u8>) {
        self.quorum_write = TimestampValuePair::new(self.epoch, value);
    }

    /// Latest observed write-quorum pair.
    pub fn quorum_write(&self) -> &TimestampValuePair {
        &self.quorum_write
    }

    /// Every (epoch, value) pair this replica wrote for the instance.
    pub fn write_set(&self) -> &BTreeSet<TimestampValuePair> {
        &self.write_set
    }

    /// Assemble this replica's collect snapshot for a leader change.
    pub fn collect(&self, sender: warbft_types::ProcessId, regency: Regency) -> CollectData {
        CollectData::new(
            sender,
            self.eid,
            regency,
            self.quorum_write.clone(),
            self.write_set.clone(),
        )
    }
}
