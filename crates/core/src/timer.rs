//! Round timer scheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warbft_types::ConsensusId;

/// Handle to a pending round timer.
///
/// Cancellation is idempotent and purely advisory: a scheduler whose timer
/// task has already fired observes the flag and drops the callback.
/// Dropping the handle does NOT cancel the timer; freezing or deciding the
/// round must cancel explicitly.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create a live (not yet cancelled) handle.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the pending timer.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the timer was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// External scheduler owning the blocking timer threads.
///
/// The engine schedules one deadline per live round and expects the
/// scheduler to call back into `Acceptor::on_timeout` when the deadline
/// passes without cancellation.
pub trait TimerScheduler: Send + Sync {
    /// Schedule a timeout for `(eid, round)` after `deadline`.
    fn schedule(&self, eid: ConsensusId, round: u32, deadline: Duration) -> CancelHandle;
}
