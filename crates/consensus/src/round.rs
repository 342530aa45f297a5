//! Per-round vote accumulator for one consensus instance.

use warbft_core::CancelHandle;
use warbft_messages::ConsensusMessage;

/// Vote bookkeeping for one round of one consensus instance.
///
/// Weak and strong vote slots are indexed by acceptor position in the view
/// and are set-once: the first value stored for a position sticks until
/// the round is frozen, after which all mutation silently no-ops. Round
/// k+1 inherits (deep-copies) round k's vote arrays so escalating votes
/// survive a round bump.
#[derive(Debug)]
pub struct Round {
    number: u32,
    weak: Vec<Option<Vec<u8>>>,
    strong: Vec<Option<Vec<u8>>>,
    proposed_value: Option<Vec<u8>>,
    proposed_hash: Option<Vec<u8>>,
    frozen: bool,
    collected: bool,
    removed: bool,
    proofs: Option<Vec<Option<ConsensusMessage>>>,
    timer: Option<CancelHandle>,
}

impl Round {
    /// Create a fresh round with empty vote arrays sized for `n` acceptors.
    pub fn new(number: u32, n: usize) -> Self {
        Self {
            number,
            weak: vec![None; n],
            strong: vec![None; n],
            proposed_value: None,
            proposed_hash: None,
            frozen: false,
            collected: false,
            removed: false,
            proofs: None,
            timer: None,
        }
    }

    /// Create a round inheriting the vote arrays of a previous round.
    ///
    /// The copies are deep: later mutation of this round never touches the
    /// previous round's recorded votes.
    pub fn inheriting(number: u32, previous: &Round) -> Self {
        Self {
            number,
            weak: previous.weak.clone(),
            strong: previous.strong.clone(),
            proposed_value: None,
            proposed_hash: None,
            frozen: false,
            collected: false,
            removed: false,
            proofs: None,
            timer: None,
        }
    }

    /// Round number within the instance.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Record the leader's proposal. Set-once; returns false if a
    /// proposal was already accepted or the round is frozen.
    pub fn set_proposed(&mut self, value: Vec<u8>, hash: Vec<u8>) -> bool {
        if self.frozen || self.proposed_value.is_some() {
            return false;
        }
        self.proposed_value = Some(value);
        self.proposed_hash = Some(hash);
        true
    }

    /// The full proposed value, if a proposal was accepted this round.
    pub fn proposed_value(&self) -> Option<&[u8]> {
        self.proposed_value.as_deref()
    }

    /// Hash bytes of the proposed value.
    pub fn proposed_hash(&self) -> Option<&[u8]> {
        self.proposed_hash.as_deref()
    }

    /// Record a weak vote for the acceptor at `pos`. No-op once frozen or
    /// once a vote is already recorded for that position.
    pub fn set_weak(&mut self, pos: usize, value: Vec<u8>) {
        if self.frozen {
            return;
        }
        if let Some(slot) = self.weak.get_mut(pos) {
            if slot.is_none() {
                *slot = Some(value);
            }
        }
    }

    /// Record a strong vote for the acceptor at `pos`. Same discipline as
    /// [`set_weak`](Self::set_weak).
    pub fn set_strong(&mut self, pos: usize, value: Vec<u8>) {
        if self.frozen {
            return;
        }
        if let Some(slot) = self.strong.get_mut(pos) {
            if slot.is_none() {
                *slot = Some(value);
            }
        }
    }

    /// Number of weak votes exactly matching `value`.
    pub fn count_weak(&self, value: &[u8]) -> usize {
        self.weak
            .iter()
            .filter(|v| v.as_deref() == Some(value))
            .count()
    }

    /// Number of strong votes exactly matching `value`.
    pub fn count_strong(&self, value: &[u8]) -> usize {
        self.strong
            .iter()
            .filter(|v| v.as_deref() == Some(value))
            .count()
    }

    /// Whether the acceptor at `pos` has a weak vote recorded.
    pub fn is_weak_set(&self, pos: usize) -> bool {
        self.weak.get(pos).is_some_and(|v| v.is_some())
    }

    /// Whether the acceptor at `pos` has a strong vote recorded.
    pub fn is_strong_set(&self, pos: usize) -> bool {
        self.strong.get(pos).is_some_and(|v| v.is_some())
    }

    /// The strong vote recorded for the acceptor at `pos`, if any.
    pub fn strong_vote(&self, pos: usize) -> Option<&[u8]> {
        self.strong.get(pos).and_then(|v| v.as_deref())
    }

    /// Mark the round terminal. Cancels the pending timer; all further
    /// vote mutation becomes a no-op.
    pub fn freeze(&mut self) {
        self.frozen = true;
        self.cancel_timer();
    }

    /// Whether the round was frozen by leader change.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Mark that a collect snapshot was emitted for this round.
    pub fn set_collected(&mut self) {
        self.collected = true;
    }

    /// Whether a collect snapshot was emitted for this round.
    pub fn is_collected(&self) -> bool {
        self.collected
    }

    /// Mark the round as pruned by `Execution::remove_rounds`.
    pub fn mark_removed(&mut self) {
        self.removed = true;
        self.cancel_timer();
    }

    /// Whether the round was pruned.
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Store an acceptor's STRONG attestation in its proof slot.
    ///
    /// The slot array is allocated lazily on first use; one slot per
    /// acceptor, first attestation wins.
    pub fn add_proof(&mut self, pos: usize, message: ConsensusMessage) {
        let n = self.weak.len();
        let proofs = self.proofs.get_or_insert_with(|| vec![None; n]);
        if let Some(slot) = proofs.get_mut(pos) {
            if slot.is_none() {
                *slot = Some(message);
            }
        }
    }

    /// Accumulated STRONG attestations, for building a certified decision.
    pub fn proofs(&self) -> Vec<ConsensusMessage> {
        self.proofs
            .as_ref()
            .map(|slots| slots.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Attach the round's pending timer handle.
    pub fn set_timer(&mut self, handle: CancelHandle) {
        self.timer = Some(handle);
    }

    /// Whether a timer is attached.
    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Cancel the pending timer, if any.
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
