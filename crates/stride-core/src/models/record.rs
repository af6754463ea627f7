//! Syncable record model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::entity::EntityType;

/// Domain payload of a record (the entity's own fields)
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Stable record identifier.
///
/// Locally created records use UUID v7 (time-sortable); ids pulled from the
/// remote are kept verbatim. Ordering is plain string ordering and is used to
/// break `updated_at` ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the string representation of this ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            Err("record id cannot be empty".to_string())
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Per-record synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Local copy matches the last acknowledged remote state
    #[default]
    Synced,
    /// Local edits waiting to be pushed
    PendingPush,
    /// Remote changes known but not yet applied locally
    PendingPull,
    /// Diverging concurrent edit awaiting resolution
    Conflict,
    /// Last push attempt was rejected; retried on a later cycle
    Error,
}

impl SyncState {
    /// Column value in the local store
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::PendingPush => "pending_push",
            Self::PendingPull => "pending_pull",
            Self::Conflict => "conflict",
            Self::Error => "error",
        }
    }

    /// Whether a record in this state counts towards `pending_changes`
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::PendingPush | Self::Error | Self::Conflict)
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending_push" => Ok(Self::PendingPush),
            "pending_pull" => Ok(Self::PendingPull),
            "conflict" => Ok(Self::Conflict),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown sync state '{other}'")),
        }
    }
}

/// A record mirrored in the local store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    /// Stable identifier
    pub id: RecordId,
    /// Collection the record belongs to
    pub entity_type: EntityType,
    /// Domain fields
    pub payload: Payload,
    /// Authoritative last update timestamp (Unix ms)
    pub updated_at: i64,
    /// Tombstone marker (Unix ms)
    pub deleted_at: Option<i64>,
    /// Incremented on every local mutation
    pub local_version: i64,
    /// Last acknowledged remote state token
    pub remote_version: Option<String>,
    /// Remote `updated_at` seen at the previous sync of this record
    pub last_remote_updated_at: Option<i64>,
    /// Has unpushed local mutations
    pub dirty: bool,
    /// Sync state
    pub sync_state: SyncState,
    /// Consecutive rejected push attempts
    pub push_attempts: u32,
    /// Earliest time the next push may be attempted (Unix ms)
    pub next_attempt_at: Option<i64>,
    /// Reason given by the last rejection
    pub last_error: Option<String>,
}

impl SyncableRecord {
    /// Create a new local record with a fresh id
    #[must_use]
    pub fn new(entity_type: EntityType, payload: Payload) -> Self {
        Self::with_id(entity_type, RecordId::new(), payload)
    }

    /// Create a new local record with a caller-chosen id
    #[must_use]
    pub fn with_id(entity_type: EntityType, id: RecordId, payload: Payload) -> Self {
        Self {
            id,
            entity_type,
            payload,
            updated_at: crate::util::now_ms(),
            deleted_at: None,
            local_version: 0,
            remote_version: None,
            last_remote_updated_at: None,
            dirty: true,
            sync_state: SyncState::PendingPush,
            push_attempts: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Whether this record is a deletion marker
    pub const fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether a dirty record may be pushed at `now_ms`
    pub fn is_push_due(&self, now_ms: i64) -> bool {
        self.dirty
            && self.sync_state != SyncState::Conflict
            && self.next_attempt_at.is_none_or(|at| at <= now_ms)
    }

    /// Id of the referenced parent record, if the payload names one
    pub fn parent_id(&self) -> Option<&str> {
        let key = self.entity_type.parent_key()?;
        self.payload.get(key).and_then(serde_json::Value::as_str)
    }
}
