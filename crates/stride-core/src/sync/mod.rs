//! Offline sync: conflict policy, status broadcast and the orchestrator

pub mod conflict;
mod engine;
mod status;

pub use conflict::{PullAction, Winner};
pub use engine::{EntityCycleState, EntityReport, StopHandle, SyncEngine, SyncReport};
pub use status::{StatusBroadcaster, Subscription};
