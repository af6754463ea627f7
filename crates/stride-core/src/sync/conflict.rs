//! Conflict resolution policy
//!
//! Classifies each pulled row against the local copy and builds the settled
//! record for a resolution. Resolution is whole-record: there is no
//! field-level merge.

use crate::models::{
    ConflictLogEntry, ConflictRecord, RecordSnapshot, ResolutionStrategy, SyncState,
    SyncableRecord,
};
use crate::remote::RemoteRow;

/// What a pull should do with one remote row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullAction {
    /// No local copy: store the row as synced
    Insert,
    /// Clean local copy already equals the row
    Skip,
    /// Clean local copy: replace it with the row
    Overwrite,
    /// Dirty local copy and the remote has not moved since we last saw it, or
    /// only holds our own write
    KeepLocal,
    /// Dirty local copy and the remote moved as well
    Conflict,
    /// A conflict is already open: refresh its remote snapshot
    RefreshConflict,
}

/// Side kept by last-write-wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

pub fn classify(local: Option<&SyncableRecord>, remote: &RemoteRow) -> PullAction {
    let Some(local) = local else {
        return PullAction::Insert;
    };

    if local.sync_state == SyncState::Conflict {
        return PullAction::RefreshConflict;
    }

    if !local.dirty {
        return if matches_remote(local, remote) {
            PullAction::Skip
        } else {
            PullAction::Overwrite
        };
    }

    // Our own write came back, possibly after its push response was lost
    if local.payload == remote.payload && local.deleted_at == remote.deleted_at {
        return PullAction::KeepLocal;
    }

    // Our own accepted push comes back with the timestamp we already recorded
    match local.last_remote_updated_at {
        Some(last_seen) if remote.updated_at <= last_seen => PullAction::KeepLocal,
        _ => PullAction::Conflict,
    }
}

fn matches_remote(local: &SyncableRecord, remote: &RemoteRow) -> bool {
    local.updated_at == remote.updated_at
        && local.deleted_at == remote.deleted_at
        && local.payload == remote.payload
        && (remote.version.is_none() || local.remote_version == remote.version)
}

/// Later `updated_at` wins; the remote wins ties
pub const fn last_write_wins(local_updated_at: i64, remote_updated_at: i64) -> Winner {
    if local_updated_at > remote_updated_at {
        Winner::Local
    } else {
        Winner::Remote
    }
}

pub fn snapshot_of_remote(remote: &RemoteRow) -> RecordSnapshot {
    RecordSnapshot {
        payload: remote.payload.clone(),
        updated_at: remote.updated_at,
        deleted_at: remote.deleted_at,
        version: remote.version.clone(),
    }
}

pub fn new_conflict(
    local: &SyncableRecord,
    remote: &RemoteRow,
    detected_at: i64,
) -> ConflictRecord {
    ConflictRecord {
        entity_type: local.entity_type,
        id: local.id.clone(),
        local: RecordSnapshot::of_local(local),
        remote: snapshot_of_remote(remote),
        detected_at,
    }
}

/// Keep the local payload and queue it to overwrite `remote`.
///
/// `updated_at` moves past the remote's so the next pull treats the remote
/// row as already seen.
pub fn keep_local(local: &SyncableRecord, remote: &RecordSnapshot, now: i64) -> SyncableRecord {
    SyncableRecord {
        updated_at: now.max(remote.updated_at + 1),
        remote_version: remote.version.clone(),
        last_remote_updated_at: Some(remote.updated_at),
        dirty: true,
        sync_state: SyncState::PendingPush,
        push_attempts: 0,
        next_attempt_at: None,
        last_error: None,
        ..local.clone()
    }
}

/// Discard local edits in favour of `remote`
pub fn take_remote(local: &SyncableRecord, remote: &RecordSnapshot) -> SyncableRecord {
    SyncableRecord {
        payload: remote.payload.clone(),
        updated_at: remote.updated_at,
        deleted_at: remote.deleted_at,
        remote_version: remote.version.clone(),
        last_remote_updated_at: Some(remote.updated_at),
        dirty: false,
        sync_state: SyncState::Synced,
        push_attempts: 0,
        next_attempt_at: None,
        last_error: None,
        ..local.clone()
    }
}

pub fn log_entry(
    local: &SyncableRecord,
    remote: &RecordSnapshot,
    strategy: ResolutionStrategy,
    resolved_at: i64,
) -> ConflictLogEntry {
    ConflictLogEntry {
        id: 0,
        entity_type: local.entity_type,
        record_id: local.id.to_string(),
        local_updated_at: local.updated_at,
        incoming_updated_at: remote.updated_at,
        resolved_at,
        strategy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, Payload, RecordId};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn synced_goal(updated_at: i64) -> SyncableRecord {
        let mut record = SyncableRecord::with_id(
            EntityType::Goals,
            RecordId::from("G1"),
            payload(json!({ "title": "Run" })),
        );
        record.updated_at = updated_at;
        record.dirty = false;
        record.sync_state = SyncState::Synced;
        record.last_remote_updated_at = Some(updated_at);
        record.remote_version = Some("1".to_string());
        record
    }

    fn remote_goal(title: &str, updated_at: i64) -> RemoteRow {
        RemoteRow {
            id: RecordId::from("G1"),
            updated_at,
            deleted_at: None,
            version: Some("1".to_string()),
            payload: payload(json!({ "title": title })),
        }
    }

    #[test]
    fn missing_local_is_inserted() {
        assert_eq!(classify(None, &remote_goal("Run", 5)), PullAction::Insert);
    }

    #[test]
    fn identical_clean_copy_is_skipped() {
        let local = synced_goal(10);
        assert_eq!(classify(Some(&local), &remote_goal("Run", 10)), PullAction::Skip);
        assert_eq!(
            classify(Some(&local), &remote_goal("Walk", 11)),
            PullAction::Overwrite
        );
    }

    #[test]
    fn dirty_copy_wins_when_remote_has_not_moved() {
        let mut local = synced_goal(10);
        local.dirty = true;
        local.sync_state = SyncState::PendingPush;
        assert_eq!(
            classify(Some(&local), &remote_goal("Run", 10)),
            PullAction::KeepLocal
        );
        assert_eq!(
            classify(Some(&local), &remote_goal("Walk", 11)),
            PullAction::Conflict
        );
    }

    #[test]
    fn never_synced_dirty_copy_conflicts() {
        let local = SyncableRecord::with_id(
            EntityType::Goals,
            RecordId::from("G1"),
            payload(json!({ "title": "Mine" })),
        );
        assert_eq!(
            classify(Some(&local), &remote_goal("Theirs", 1)),
            PullAction::Conflict
        );
    }

    #[test]
    fn echo_of_unacknowledged_push_is_kept_local() {
        let local = SyncableRecord::with_id(
            EntityType::Goals,
            RecordId::from("G1"),
            payload(json!({ "title": "Run" })),
        );
        assert_eq!(
            classify(Some(&local), &remote_goal("Run", local.updated_at + 500)),
            PullAction::KeepLocal
        );

        let mut tombstone = local.clone();
        tombstone.deleted_at = Some(tombstone.updated_at);
        assert_eq!(
            classify(Some(&tombstone), &remote_goal("Run", local.updated_at + 500)),
            PullAction::Conflict
        );
    }

    #[test]
    fn open_conflict_is_refreshed() {
        let mut local = synced_goal(10);
        local.dirty = true;
        local.sync_state = SyncState::Conflict;
        assert_eq!(
            classify(Some(&local), &remote_goal("Walk", 20)),
            PullAction::RefreshConflict
        );
    }

    #[test]
    fn last_write_wins_prefers_remote_on_ties() {
        assert_eq!(last_write_wins(10, 10), Winner::Remote);
        assert_eq!(last_write_wins(11, 10), Winner::Local);
        assert_eq!(last_write_wins(9, 10), Winner::Remote);
    }

    #[test]
    fn keep_local_moves_past_remote() {
        let mut local = synced_goal(10);
        local.dirty = true;
        let remote = snapshot_of_remote(&remote_goal("Walk", 50));

        let settled = keep_local(&local, &remote, 20);
        assert!(settled.dirty);
        assert_eq!(settled.sync_state, SyncState::PendingPush);
        assert_eq!(settled.updated_at, 51);
        assert_eq!(settled.last_remote_updated_at, Some(50));
        assert_eq!(settled.payload["title"], "Run");
    }

    #[test]
    fn take_remote_overwrites_payload() {
        let mut local = synced_goal(10);
        local.dirty = true;
        let remote = snapshot_of_remote(&remote_goal("Walk", 50));

        let settled = take_remote(&local, &remote);
        assert!(!settled.dirty);
        assert_eq!(settled.sync_state, SyncState::Synced);
        assert_eq!(settled.payload, remote.payload);
        assert_eq!(settled.updated_at, 50);
    }
}
