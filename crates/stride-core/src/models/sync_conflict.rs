//! Sync conflict models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::entity::EntityType;
use super::record::{Payload, RecordId, SyncableRecord};

/// Point-in-time copy of one side of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub payload: Payload,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    /// Remote state token, when the snapshot came from the remote
    pub version: Option<String>,
}

impl RecordSnapshot {
    /// Snapshot of a local record
    pub fn of_local(record: &SyncableRecord) -> Self {
        Self {
            payload: record.payload.clone(),
            updated_at: record.updated_at,
            deleted_at: record.deleted_at,
            version: record.remote_version.clone(),
        }
    }
}

/// An unresolved divergence between a dirty local record and a newer remote row.
///
/// Persists until resolved; the record is excluded from automatic push while
/// a conflict is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity_type: EntityType,
    pub id: RecordId,
    pub local: RecordSnapshot,
    pub remote: RecordSnapshot,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
}

/// Manual resolution choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionChoice {
    /// Keep the local payload and push it over the remote
    Local,
    /// Discard local edits in favour of the stored remote snapshot
    Remote,
}

impl FromStr for ResolutionChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown resolution '{other}' (expected local or remote)")),
        }
    }
}

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    ManualLocal,
    ManualRemote,
    /// Automatic whole-record last-write-wins
    Lww,
}

impl ResolutionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ManualLocal => "manual_local",
            Self::ManualRemote => "manual_remote",
            Self::Lww => "lww",
        }
    }
}

impl From<ResolutionChoice> for ResolutionStrategy {
    fn from(choice: ResolutionChoice) -> Self {
        match choice {
            ResolutionChoice::Local => Self::ManualLocal,
            ResolutionChoice::Remote => Self::ManualRemote,
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual_local" => Ok(Self::ManualLocal),
            "manual_remote" => Ok(Self::ManualRemote),
            "lww" => Ok(Self::Lww),
            other => Err(format!("unknown resolution strategy '{other}'")),
        }
    }
}

/// Recorded conflict resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictLogEntry {
    /// Log row identifier
    pub id: i64,
    pub entity_type: EntityType,
    pub record_id: String,
    /// Local record's timestamp when the conflict was settled
    pub local_updated_at: i64,
    /// Incoming remote timestamp
    pub incoming_updated_at: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    pub strategy: ResolutionStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_choice_parses_case_insensitively() {
        assert_eq!("LOCAL".parse(), Ok(ResolutionChoice::Local));
        assert_eq!(" remote ".parse(), Ok(ResolutionChoice::Remote));
        assert!("merge".parse::<ResolutionChoice>().is_err());
    }

    #[test]
    fn strategy_follows_choice() {
        assert_eq!(
            ResolutionStrategy::from(ResolutionChoice::Remote),
            ResolutionStrategy::ManualRemote
        );
        assert_eq!("lww".parse(), Ok(ResolutionStrategy::Lww));
    }
}
