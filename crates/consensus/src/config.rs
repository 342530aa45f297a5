//! Engine configuration.

use std::time::Duration;

/// Tunables for the agreement engine.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Deadline for a round to decide before it is frozen and leader
    /// change begins.
    pub round_timeout: Duration,

    /// How many instances ahead of the last decided one a message may be
    /// before admission control asks the sender for state transfer
    /// instead of buffering.
    pub high_mark: i64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(3),
            high_mark: 10_000,
        }
    }
}
