//! Regency bookkeeping and the leader-change recovery predicates.
//!
//! Follows Cachin's reformulation of Byzantine view change. When a round
//! times out the replica stops, the group negotiates the next regency, and
//! the incoming leader runs the `sound`/`binds`/`unbound` predicates over
//! the normalized collect snapshots to learn whether any value may already
//! have been decided and must be re-proposed.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use warbft_messages::{CertifiedDecision, MessageKind, SignedCollect};
use warbft_types::{
    hash_value, CollectData, ConsensusId, KeyPair, ProcessId, Regency, View,
};

/// Phase of the per-regency leader-change state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderChangePhase {
    /// Following the installed leader.
    Normal,
    /// Stopped after timeout or suspicion; collecting STOPs.
    Stopped,
    /// Negotiating the next regency; collecting signed snapshots.
    Synchronizing,
    /// Catch-up in progress before resuming under the new leader.
    Resuming,
}

struct RegencyState {
    current_leader: ProcessId,
    last_regency: Regency,
    next_regency: Regency,
    phase: LeaderChangePhase,
}

/// Leader-change coordinator for one replica.
///
/// The STOP/SYNC message handling layer around the engine drives the
/// transitions; this type owns the bookkeeping and the safety predicates.
/// Each buffer map has its own lock, independent of any execution lock.
pub struct LeaderChangeManager {
    me: ProcessId,
    view: Arc<dyn View>,
    keypair: KeyPair,
    state: Mutex<RegencyState>,
    stops: Mutex<BTreeMap<Regency, BTreeSet<ProcessId>>>,
    collects: Mutex<BTreeMap<Regency, Vec<SignedCollect>>>,
    last_cids: Mutex<BTreeMap<Regency, Vec<CertifiedDecision>>>,
}

impl LeaderChangeManager {
    /// Create a manager starting at the initial regency under
    /// `initial_leader`.
    pub fn new(
        me: ProcessId,
        view: Arc<dyn View>,
        keypair: KeyPair,
        initial_leader: ProcessId,
    ) -> Self {
        Self {
            me,
            view,
            keypair,
            state: Mutex::new(RegencyState {
                current_leader: initial_leader,
                last_regency: Regency::INITIAL,
                next_regency: Regency::INITIAL,
                phase: LeaderChangePhase::Normal,
            }),
            stops: Mutex::new(BTreeMap::new()),
            collects: Mutex::new(BTreeMap::new()),
            last_cids: Mutex::new(BTreeMap::new()),
        }
    }

    /// The currently installed leader.
    pub fn leader(&self) -> ProcessId {
        self.state.lock().current_leader
    }

    /// Install a leader without changing the regency.
    pub fn set_new_leader(&self, leader: ProcessId) {
        self.state.lock().current_leader = leader;
    }

    /// Deterministic rotation: the member just after the current leader in
    /// sorted id order, wrapping from the highest id back to the lowest.
    pub fn get_new_leader(&self) -> ProcessId {
        let current = self.state.lock().current_leader;
        let processes = self.view.processes();
        match processes.iter().position(|p| *p == current) {
            Some(pos) => processes[(pos + 1) % processes.len()],
            None => processes[0],
        }
    }

    /// Current phase.
    pub fn phase(&self) -> LeaderChangePhase {
        self.state.lock().phase
    }

    /// Last installed regency.
    pub fn last_regency(&self) -> Regency {
        self.state.lock().last_regency
    }

    /// Regency currently being negotiated.
    pub fn next_regency(&self) -> Regency {
        self.state.lock().next_regency
    }

    /// Enter the stopped phase after a round timeout or suspicion.
    ///
    /// Returns the regency to negotiate when this call performs the
    /// `Normal -> Stopped` transition; `None` when a change is already
    /// under way.
    pub fn on_round_timeout(&self) -> Option<Regency> {
        let mut state = self.state.lock();
        if state.phase != LeaderChangePhase::Normal {
            return None;
        }
        state.phase = LeaderChangePhase::Stopped;
        state.next_regency = state.last_regency.next();
        info!(
            next_regency = state.next_regency.0,
            "Entering stopped phase"
        );
        Some(state.next_regency)
    }

    /// Record a STOP for `regency`; returns the distinct-sender count.
    pub fn add_stop(&self, regency: Regency, sender: ProcessId) -> usize {
        let mut stops = self.stops.lock();
        let senders = stops.entry(regency).or_default();
        senders.insert(sender);
        senders.len()
    }

    /// Distinct STOP senders recorded for `regency`.
    pub fn stop_count(&self, regency: Regency) -> usize {
        self.stops.lock().get(&regency).map_or(0, BTreeSet::len)
    }

    /// Whether a replica still in normal phase should join the stop.
    ///
    /// More than F distinct STOPs means at least one correct replica
    /// timed out, so joining is safe even without a local timeout.
    pub fn should_join_stop(&self, regency: Regency) -> bool {
        self.phase() == LeaderChangePhase::Normal && self.stop_count(regency) > self.view.f()
    }

    /// Whether enough STOPs arrived to force synchronization regardless of
    /// predicate outcome.
    pub fn stop_quorum_reached(&self, regency: Regency) -> bool {
        self.stop_count(regency) >= self.view.strong_quorum()
    }

    /// `Stopped -> Synchronizing` transition for `regency`.
    pub fn start_synchronization(&self, regency: Regency) -> bool {
        let mut state = self.state.lock();
        if state.phase != LeaderChangePhase::Stopped {
            return false;
        }
        state.phase = LeaderChangePhase::Synchronizing;
        state.next_regency = regency;
        debug!(regency = regency.0, "Synchronizing");
        true
    }

    /// `Synchronizing -> Resuming` transition once the catch-up value is
    /// known.
    pub fn begin_resume(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != LeaderChangePhase::Synchronizing {
            return false;
        }
        state.phase = LeaderChangePhase::Resuming;
        true
    }

    /// Install `regency` under `leader` and return to normal phase,
    /// pruning all bookkeeping at or below the installed regency.
    pub fn install_regency(&self, regency: Regency, leader: ProcessId) {
        {
            let mut state = self.state.lock();
            state.last_regency = regency;
            state.next_regency = regency;
            state.current_leader = leader;
            state.phase = LeaderChangePhase::Normal;
        }
        self.remove_stops_up_to(regency);
        self.remove_collects_up_to(regency);
        self.remove_last_cids_up_to(regency);
        info!(regency = regency.0, leader = leader.0, "Installed regency");
    }

    /// Discard STOP bookkeeping for regencies `<= regency`.
    pub fn remove_stops_up_to(&self, regency: Regency) {
        self.stops.lock().retain(|r, _| *r > regency);
    }

    /// Discard collect bookkeeping for regencies `<= regency`.
    pub fn remove_collects_up_to(&self, regency: Regency) {
        self.collects.lock().retain(|r, _| *r > regency);
    }

    /// Discard last-decision bookkeeping for regencies `<= regency`.
    pub fn remove_last_cids_up_to(&self, regency: Regency) {
        self.last_cids.lock().retain(|r, _| *r > regency);
    }

    /// Sign this replica's own collect snapshot.
    pub fn sign_collect(&self, collect: CollectData) -> SignedCollect {
        let signature = self.keypair.sign(&collect.signing_bytes());
        SignedCollect { collect, signature }
    }

    /// Buffer a signed collect for `regency`; one per sender, first wins.
    pub fn add_collect(&self, regency: Regency, signed: SignedCollect) {
        let mut collects = self.collects.lock();
        let entries = collects.entry(regency).or_default();
        if entries
            .iter()
            .any(|e| e.collect.sender == signed.collect.sender)
        {
            return;
        }
        entries.push(signed);
    }

    /// Signed collects buffered for `regency`.
    pub fn collect_count(&self, regency: Regency) -> usize {
        self.collects.lock().get(&regency).map_or(0, Vec::len)
    }

    /// Buffer a peer's certified last decision for `regency`; one per
    /// sender, first wins.
    pub fn add_last_cid(&self, regency: Regency, decision: CertifiedDecision) {
        let mut last_cids = self.last_cids.lock();
        let entries = last_cids.entry(regency).or_default();
        if entries.iter().any(|e| e.sender == decision.sender) {
            return;
        }
        entries.push(decision);
    }

    /// Highest proof-valid claimed decision for `regency`, telling the
    /// group where catch-up must reach before resuming.
    pub fn highest_valid_last_cid(&self, regency: Regency) -> Option<CertifiedDecision> {
        let last_cids = self.last_cids.lock();
        last_cids
            .get(&regency)?
            .iter()
            .filter(|cd| self.has_valid_proof(cd))
            .max_by_key(|cd| cd.eid)
            .cloned()
    }

    /// Verify and normalize the collects buffered for `regency` against
    /// the contested instance `eid`.
    ///
    /// Collects with invalid signatures are dropped. A collect reporting a
    /// different instance is rewritten to the empty snapshot: a replica
    /// that is behind is conservatively treated as having contributed
    /// nothing rather than as a source of stale data. Value hashes are
    /// recomputed here and nowhere else; hashes arriving off the wire are
    /// never trusted.
    pub fn select_collects(&self, regency: Regency, eid: ConsensusId) -> Vec<CollectData> {
        let signed: Vec<SignedCollect> = self
            .collects
            .lock()
            .get(&regency)
            .cloned()
            .unwrap_or_default();

        let mut selected = Vec::with_capacity(signed.len());
        for entry in signed {
            let sender = entry.collect.sender;
            let Some(public_key) = self.view.public_key(sender) else {
                warn!(sender = sender.0, "Collect from unknown process");
                continue;
            };
            if !entry.verify(&public_key) {
                warn!(sender = sender.0, "Dropping collect with bad signature");
                continue;
            }

            let mut data = if entry.collect.eid == eid {
                entry.collect
            } else {
                debug!(
                    sender = sender.0,
                    reported = entry.collect.eid.0,
                    target = eid.0,
                    "Normalizing lagging collect to empty"
                );
                CollectData::empty(sender, eid, regency)
            };

            data.quorum_write.rehash();
            data.write_set = data
                .write_set
                .into_iter()
                .map(|mut pair| {
                    pair.rehash();
                    pair
                })
                .collect();
            selected.push(data);
        }
        selected
    }

    // Recovery predicates. All value arguments are hash bytes as produced
    // by collect normalization.

    /// Whether it is safe for a new leader to proceed: some (timestamp,
    /// value) pair binds, or provably nothing was ever locked in.
    pub fn sound(&self, collects: &[CollectData]) -> bool {
        let (timestamps, values) = candidate_pairs(collects);
        for ts in &timestamps {
            for value in &values {
                if self.binds(*ts, value, collects) {
                    return true;
                }
            }
        }
        self.unbound(collects)
    }

    /// Whether `(ts, value)` is the single pair a new leader must
    /// re-propose.
    pub fn binds(&self, ts: u64, value: &[u8], collects: &[CollectData]) -> bool {
        !value.is_empty()
            && collects.len() > self.view.n() - self.view.f()
            && self.quorum_highest(ts, value, collects)
            && self.certified_value(ts, value, collects)
    }

    /// Whether `(ts, value)` appears as some replica's quorum-write and
    /// dominates a qualifying majority of reported quorum-writes.
    pub fn quorum_highest(&self, ts: u64, value: &[u8], collects: &[CollectData]) -> bool {
        let appears = collects
            .iter()
            .any(|c| c.quorum_write.timestamp == ts && c.quorum_write.hashed == value);
        if !appears {
            return false;
        }

        let dominated = collects
            .iter()
            .filter(|c| {
                c.quorum_write.timestamp < ts
                    || (c.quorum_write.timestamp == ts && c.quorum_write.hashed == value)
            })
            .count();
        dominated > self.qualifying_majority()
    }

    /// Whether enough write-set entries certify that `(ts, value)` could
    /// have been decided: more than F entries with the same hashed value
    /// at timestamp `>= ts` (any entry at all in crash-only mode).
    pub fn certified_value(&self, ts: u64, value: &[u8], collects: &[CollectData]) -> bool {
        let count = collects
            .iter()
            .flat_map(|c| c.write_set.iter())
            .filter(|pair| pair.timestamp >= ts && pair.hashed == value)
            .count();
        if self.view.is_bft() {
            count > self.view.f()
        } else {
            count > 0
        }
    }

    /// Whether a qualifying majority reports that nothing was ever locked
    /// in, so the new leader may propose freely.
    ///
    /// "Nothing locked" is the empty pair, not merely timestamp zero: a
    /// genuine write quorum observed at epoch 0 must not count as
    /// unlocked.
    pub fn unbound(&self, collects: &[CollectData]) -> bool {
        if collects.len() < self.view.n() - self.view.f() {
            return false;
        }
        let unlocked = collects
            .iter()
            .filter(|c| c.quorum_write.is_empty())
            .count();
        unlocked > self.qualifying_majority()
    }

    /// Recover the raw value for the binding pair, if any pair binds.
    ///
    /// Searches in the same order as [`sound`](Self::sound) and returns
    /// the unhashed bytes from a write-set entry matching the binding
    /// hash, ready to be re-proposed under the new regency.
    pub fn get_bind_value(&self, collects: &[CollectData]) -> Option<Vec<u8>> {
        let (timestamps, values) = candidate_pairs(collects);
        for ts in &timestamps {
            for value in &values {
                if self.binds(*ts, value, collects) {
                    return collects
                        .iter()
                        .flat_map(|c| c.write_set.iter())
                        .find(|pair| pair.hashed == *value)
                        .map(|pair| pair.value.clone());
                }
            }
        }
        None
    }

    /// Verify a peer's claimed last decision against its STRONG proof.
    ///
    /// Counts distinct senders whose proof message matches the claimed
    /// instance and value and carries a MAC tag for this replica that
    /// verifies under the sender's pairwise key. The sentinel "never
    /// decided anything" claim needs no proof.
    pub fn has_valid_proof(&self, decision: &CertifiedDecision) -> bool {
        if decision.eid == ConsensusId::NONE {
            return true;
        }

        let expected_hash = hash_value(&decision.value);
        let mut attested: BTreeSet<ProcessId> = BTreeSet::new();
        for message in &decision.proof {
            if message.kind != MessageKind::Strong
                || message.eid != decision.eid
                || message.value != expected_hash
            {
                continue;
            }
            let Some(proof) = &message.proof else {
                continue;
            };
            let Some(tag) = proof.get(&self.me) else {
                continue;
            };
            let Some(key) = self.view.mac_key(message.sender) else {
                continue;
            };
            if key.verify(&message.canonical_bytes(), tag) {
                attested.insert(message.sender);
            }
        }

        attested.len() >= self.view.certificate_quorum()
    }

    fn qualifying_majority(&self) -> usize {
        if self.view.is_bft() {
            (self.view.n() + self.view.f()) / 2
        } else {
            self.view.n() / 2
        }
    }
}

/// Distinct candidate timestamps and hashed values across all collects'
/// quorum-writes and write-sets.
fn candidate_pairs(collects: &[CollectData]) -> (BTreeSet<u64>, BTreeSet<Vec<u8>>) {
    let mut timestamps = BTreeSet::new();
    let mut values = BTreeSet::new();
    for collect in collects {
        timestamps.insert(collect.quorum_write.timestamp);
        values.insert(collect.quorum_write.hashed.clone());
        for pair in &collect.write_set {
            timestamps.insert(pair.timestamp);
            values.insert(pair.hashed.clone());
        }
    }
    (timestamps, values)
}
