//! stride-core - Core library for Stride
//!
//! Entity models, the per-device `SQLite` store, schema migrations, remote
//! client adapters and the offline sync engine shared by every Stride
//! interface.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod state;
pub mod sync;
pub mod util;

pub use config::{ConflictStrategy, RetryConfig, SyncConfig};
pub use db::{LocalStore, SqliteLocalStore};
pub use error::{Error, Result};
pub use models::{EntityType, Payload, RecordId, SyncState, SyncableRecord};
pub use remote::{HttpRemoteClient, MemoryRemote, RemoteClient};
pub use state::{EntityStatus, SyncMetadata, SyncStatusEvent};
pub use sync::{SyncEngine, SyncReport};
