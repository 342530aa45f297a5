//! Collaborator traits consumed by the warbft agreement engine.
//!
//! The engine performs no I/O of its own: transport, value validation,
//! decision delivery, state transfer and timers are all reached through
//! the traits defined here. Production wires real implementations;
//! tests wire in-memory ones.

mod timer;
mod traits;

pub use timer::{CancelHandle, TimerScheduler};
pub use traits::{
    DecodedBatch, DeliveryNotifier, StateTransferRequester, TransportBroadcast, ValueValidator,
};
