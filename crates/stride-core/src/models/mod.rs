//! Data models for Stride

mod cursor;
mod entity;
mod record;
mod sync_conflict;

pub use cursor::SyncCursor;
pub use entity::EntityType;
pub use record::{Payload, RecordId, SyncState, SyncableRecord};
pub use sync_conflict::{
    ConflictLogEntry, ConflictRecord, RecordSnapshot, ResolutionChoice, ResolutionStrategy,
};
