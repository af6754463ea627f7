//! Shared sync state types read by UI collaborators.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::EntityType;

/// Per-entity sync status shown next to each collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    #[default]
    Synced,
    Syncing,
    Error,
    Conflict,
    Pending,
}

/// Kind of a status transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncEventKind {
    #[default]
    Idle,
    Syncing,
    Success,
    Error,
}

/// Phase an entity cycle is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Pulling,
    Pushing,
}

/// Status event delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncStatusEvent {
    #[serde(rename = "type")]
    pub kind: SyncEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 0-100 while syncing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<SyncPhase>,
}

impl SyncStatusEvent {
    pub const fn idle() -> Self {
        Self {
            kind: SyncEventKind::Idle,
            message: None,
            progress: None,
            entity_type: None,
            phase: None,
        }
    }

    pub const fn syncing(
        progress: u8,
        entity_type: Option<EntityType>,
        phase: Option<SyncPhase>,
    ) -> Self {
        Self {
            kind: SyncEventKind::Syncing,
            message: None,
            progress: Some(progress),
            entity_type,
            phase,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: SyncEventKind::Success,
            message: Some(message.into()),
            progress: Some(100),
            entity_type: None,
            phase: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: SyncEventKind::Error,
            message: Some(message.into()),
            progress: None,
            entity_type: None,
            phase: None,
        }
    }
}

/// Engine-wide metadata snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub is_online: bool,
    /// Records in pending-push, error or conflict state across all collections
    pub pending_changes: usize,
    /// Unix ms of the last cycle that finished with zero conflicts and errors
    pub last_sync_at: Option<i64>,
    pub entity_status: BTreeMap<EntityType, EntityStatus>,
}

impl Default for SyncMetadata {
    fn default() -> Self {
        Self {
            is_online: true,
            pending_changes: 0,
            last_sync_at: None,
            entity_status: EntityType::SYNC_ORDER
                .into_iter()
                .map(|entity| (entity, EntityStatus::Synced))
                .collect(),
        }
    }
}

impl SyncMetadata {
    /// Worst status across all collections
    pub fn aggregate_status(&self) -> EntityStatus {
        let statuses = || self.entity_status.values().copied();
        if statuses().any(|status| status == EntityStatus::Syncing) {
            EntityStatus::Syncing
        } else if statuses().any(|status| status == EntityStatus::Error) {
            EntityStatus::Error
        } else if statuses().any(|status| status == EntityStatus::Conflict) {
            EntityStatus::Conflict
        } else if self.pending_changes > 0
            || statuses().any(|status| status == EntityStatus::Pending)
        {
            EntityStatus::Pending
        } else {
            EntityStatus::Synced
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metadata_covers_every_collection() {
        let metadata = SyncMetadata::default();
        assert_eq!(metadata.entity_status.len(), EntityType::SYNC_ORDER.len());
        assert_eq!(metadata.aggregate_status(), EntityStatus::Synced);
    }

    #[test]
    fn aggregate_prefers_error_over_conflict() {
        let mut metadata = SyncMetadata::default();
        metadata
            .entity_status
            .insert(EntityType::Goals, EntityStatus::Conflict);
        assert_eq!(metadata.aggregate_status(), EntityStatus::Conflict);

        metadata
            .entity_status
            .insert(EntityType::Tasks, EntityStatus::Error);
        assert_eq!(metadata.aggregate_status(), EntityStatus::Error);
    }

    #[test]
    fn pending_changes_make_aggregate_pending() {
        let metadata = SyncMetadata {
            pending_changes: 2,
            ..SyncMetadata::default()
        };
        assert_eq!(metadata.aggregate_status(), EntityStatus::Pending);
    }

    #[test]
    fn event_serializes_type_field() {
        let json = serde_json::to_value(SyncStatusEvent::success("done")).unwrap();
        assert_eq!(json["type"], "success");
        assert_eq!(json["progress"], 100);
        assert!(json.get("phase").is_none());
    }
}
