//! Remote client adapter
//!
//! The remote exposes timestamped row snapshots per collection and accepts
//! idempotent batched writes. Unreachable or timed-out calls are reported as
//! [`RemoteError::Network`] so the engine can go offline without treating
//! them as data errors.

mod http;
mod memory;

pub use http::HttpRemoteClient;
pub use memory::{CallCounts, MemoryRemote};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error;
use crate::models::{EntityType, Payload, RecordId, SyncCursor, SyncState, SyncableRecord};

/// Errors reported by a remote client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Unreachable, refused or timed out
    #[error("Remote unreachable: {0}")]
    Network(String),

    /// The remote refused the whole request
    #[error("Remote error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The response could not be understood
    #[error("Invalid remote response: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Whether repeating the same call later may succeed
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Server { status, .. } => *status >= 500 || *status == 429,
            Self::Protocol(_) => false,
        }
    }
}

impl From<RemoteError> for Error {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Network(message) => Self::Network(message),
            RemoteError::Server { status, message } => Self::Remote { status, message },
            RemoteError::Protocol(message) => Self::Remote { status: 0, message },
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Envelope fields of [`RemoteRow`] and [`PushItem`]; a payload using one
/// would emit a duplicate JSON key
pub const RESERVED_PAYLOAD_KEYS: [&str; 5] =
    ["id", "updatedAt", "deletedAt", "version", "localVersion"];

/// First payload key that collides with the wire envelope
pub fn reserved_payload_key(payload: &Payload) -> Option<&'static str> {
    RESERVED_PAYLOAD_KEYS
        .into_iter()
        .find(|key| payload.contains_key(*key))
}

/// One row as stored remotely, tombstones included
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRow {
    pub id: RecordId,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    /// Remote state token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl RemoteRow {
    /// Local representation of this row as a clean, synced record
    pub fn to_record(&self, entity_type: EntityType) -> SyncableRecord {
        SyncableRecord {
            id: self.id.clone(),
            entity_type,
            payload: self.payload.clone(),
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            local_version: 0,
            remote_version: self.version.clone(),
            last_remote_updated_at: Some(self.updated_at),
            dirty: false,
            sync_state: SyncState::Synced,
            push_attempts: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }
}

/// One record in a push batch; `(id, local_version)` is the idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushItem {
    pub id: RecordId,
    pub local_version: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl From<&SyncableRecord> for PushItem {
    fn from(record: &SyncableRecord) -> Self {
        Self {
            id: record.id.clone(),
            local_version: record.local_version,
            updated_at: record.updated_at,
            deleted_at: record.deleted_at,
            payload: record.payload.clone(),
        }
    }
}

/// Per-record push result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PushOutcome {
    #[serde(rename_all = "camelCase")]
    Accepted {
        id: RecordId,
        remote_version: String,
        /// Authoritative `updated_at` assigned by the remote
        updated_at: i64,
    },
    Rejected { id: RecordId, reason: String },
}

impl PushOutcome {
    pub fn id(&self) -> &RecordId {
        match self {
            Self::Accepted { id, .. } | Self::Rejected { id, .. } => id,
        }
    }
}

/// Remote store contract consumed by the sync engine
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Cheap reachability check issued before each cycle
    async fn probe(&self) -> RemoteResult<()>;

    /// Rows strictly after `cursor`, ordered by `(updated_at, id)` ascending.
    ///
    /// A page shorter than `limit` is the last one.
    async fn pull(
        &self,
        entity_type: EntityType,
        cursor: &SyncCursor,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRow>>;

    /// Write a batch; one outcome per item, matched by id
    async fn push(
        &self,
        entity_type: EntityType,
        batch: &[PushItem],
    ) -> RemoteResult<Vec<PushOutcome>>;
}
