//! Local store adapter
//!
//! Durable per-device mirror of every collection plus sync metadata. Each
//! method is a single statement or a single transaction, so a partially
//! written record is never observable. All access goes through one mutex
//! around the connection, which also serializes writes per record.

#![allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation, clippy::cast_sign_loss)] // SQLite uses i64

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::connection::Database;
use super::migrations::{Migration, MigrationRecord, MigrationStatus};
use crate::error::Result;
use crate::models::{
    ConflictLogEntry, ConflictRecord, EntityType, RecordId, RecordSnapshot, ResolutionStrategy,
    SyncCursor, SyncState, SyncableRecord,
};
use crate::util::now_ms;

/// Acknowledgement of one pushed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushAck {
    /// `local_version` read before the push
    pub local_version: i64,
    pub remote_version: String,
    /// Authoritative remote `updated_at` after the write
    pub remote_updated_at: i64,
}

/// Outcome of a guarded conflict resolution write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionWrite {
    /// Record written and logged
    Committed,
    /// No conflict was open; nothing written
    NoOpenConflict,
    /// The record moved past the expected version; nothing written
    Stale,
}

/// Trait for local store operations
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get one record, tombstones included
    async fn get(&self, entity_type: EntityType, id: &RecordId) -> Result<Option<SyncableRecord>>;

    /// All records of a collection, tombstones included, ordered by id
    async fn get_all(&self, entity_type: EntityType) -> Result<Vec<SyncableRecord>>;

    /// Dirty records that are not held by an open conflict
    async fn get_dirty(&self, entity_type: EntityType) -> Result<Vec<SyncableRecord>>;

    /// Write a record, bumping `local_version`.
    ///
    /// With `dirty = true` this is a local edit: the record becomes pending push
    /// (or stays in conflict). With `dirty = false` it is stored as synced.
    async fn upsert(&self, record: &SyncableRecord, dirty: bool) -> Result<SyncableRecord>;

    /// Store a pulled remote snapshot as synced.
    ///
    /// Only applies when the local row is still at `expected_version` and clean
    /// (`None` means the row must not exist yet). Returns whether it applied.
    async fn apply_remote(
        &self,
        record: &SyncableRecord,
        expected_version: Option<i64>,
    ) -> Result<bool>;

    /// Keep a dirty local edit over a remote row that has not advanced, noting
    /// the remote timestamp and re-queueing the record for push.
    async fn keep_local(
        &self,
        entity_type: EntityType,
        id: &RecordId,
        remote_updated_at: i64,
        expected_version: i64,
    ) -> Result<bool>;

    /// Clear `dirty` if the record is still at `ack.local_version`.
    ///
    /// The remote version and timestamp are recorded either way; returns
    /// whether dirty was cleared.
    async fn mark_synced(&self, entity_type: EntityType, id: &RecordId, ack: &PushAck)
        -> Result<bool>;

    /// Record a rejected push; the record stays dirty in error state
    async fn mark_push_failed(
        &self,
        entity_type: EntityType,
        id: &RecordId,
        reason: &str,
        next_attempt_at: i64,
    ) -> Result<()>;

    async fn get_cursor(&self, entity_type: EntityType) -> Result<SyncCursor>;

    async fn set_cursor(&self, entity_type: EntityType, cursor: &SyncCursor) -> Result<()>;

    /// Records in pending-push, error or conflict state
    async fn count_pending(&self, entity_type: Option<EntityType>) -> Result<usize>;

    /// Number of records per sync state in one collection
    async fn state_counts(&self, entity_type: EntityType) -> Result<HashMap<SyncState, usize>>;

    /// Open (or refresh) a conflict and move the record into conflict state
    async fn open_conflict(&self, conflict: &ConflictRecord) -> Result<()>;

    async fn get_conflict(
        &self,
        entity_type: EntityType,
        id: &RecordId,
    ) -> Result<Option<ConflictRecord>>;

    async fn list_conflicts(&self, entity_type: Option<EntityType>) -> Result<Vec<ConflictRecord>>;

    /// Write the settled record, close its conflict and append to the log.
    ///
    /// Only applies while the local row is still at `expected_version`
    /// (`None` means the row must not exist). With `require_open_conflict`,
    /// nothing is written unless a conflict was open.
    async fn commit_resolution(
        &self,
        record: &SyncableRecord,
        entry: &ConflictLogEntry,
        expected_version: Option<i64>,
        require_open_conflict: bool,
    ) -> Result<ResolutionWrite>;

    /// Most recent conflict resolutions, newest first
    async fn list_conflict_log(&self, limit: usize) -> Result<Vec<ConflictLogEntry>>;

    /// Physically remove acknowledged tombstones deleted before `older_than`
    async fn purge_tombstones(&self, older_than: i64) -> Result<usize>;

    async fn get_meta(&self, key: &str) -> Result<Option<String>>;

    async fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    /// Persisted migration states
    async fn migration_ledger(&self) -> Result<Vec<MigrationRecord>>;

    async fn set_migration_status(
        &self,
        migration: &Migration,
        status: MigrationStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Run a migration's statements and mark it applied, atomically
    async fn apply_migration(&self, migration: &Migration) -> Result<()>;
}

const RECORD_COLUMNS: &str = "entity_type, id, payload, updated_at, deleted_at, local_version,
     remote_version, last_remote_updated_at, dirty, sync_state, push_attempts,
     next_attempt_at, last_error";

/// `SQLite` implementation of `LocalStore`
#[derive(Clone)]
pub struct SqliteLocalStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteLocalStore {
    /// Open a store at the given filesystem path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_database(Database::open(path)?)
    }

    /// Open an in-memory store (primarily for tests)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_database(Database::open_in_memory()?)
    }

    fn from_database(database: Database) -> Result<Self> {
        database.connection().execute(
            "CREATE TABLE IF NOT EXISTS migration_ledger (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                error TEXT
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(database)),
        })
    }

    async fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T> + Send,
    ) -> Result<T> {
        let mut db = self.db.lock().await;
        f(db.connection_mut())
    }

    /// Parse a record from a row selected with `RECORD_COLUMNS`
    fn parse_record(row: &Row<'_>) -> rusqlite::Result<SyncableRecord> {
        let entity_type: String = row.get(0)?;
        let id: String = row.get(1)?;
        let payload: String = row.get(2)?;
        let sync_state: String = row.get(9)?;
        Ok(SyncableRecord {
            entity_type: entity_type.parse::<EntityType>().map_err(|e| conversion_error(0, e))?,
            id: RecordId::from(id),
            payload: serde_json::from_str(&payload)
                .map_err(|e| conversion_error(2, e.to_string()))?,
            updated_at: row.get(3)?,
            deleted_at: row.get(4)?,
            local_version: row.get(5)?,
            remote_version: row.get(6)?,
            last_remote_updated_at: row.get(7)?,
            dirty: row.get::<_, i32>(8)? != 0,
            sync_state: sync_state.parse::<SyncState>().map_err(|e| conversion_error(9, e))?,
            push_attempts: row.get::<_, i64>(10)? as u32,
            next_attempt_at: row.get(11)?,
            last_error: row.get(12)?,
        })
    }

    fn parse_conflict(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
        let entity_type: String = row.get(0)?;
        let id: String = row.get(1)?;
        let local: String = row.get(2)?;
        let remote: String = row.get(3)?;
        Ok(ConflictRecord {
            entity_type: entity_type.parse::<EntityType>().map_err(|e| conversion_error(0, e))?,
            id: RecordId::from(id),
            local: parse_snapshot(&local, 2)?,
            remote: parse_snapshot(&remote, 3)?,
            detected_at: row.get(4)?,
        })
    }

    fn select_record(
        conn: &Connection,
        entity_type: EntityType,
        id: &RecordId,
    ) -> Result<Option<SyncableRecord>> {
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE entity_type = ? AND id = ?"),
                params![entity_type.as_str(), id.as_str()],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    fn select_records(
        conn: &Connection,
        filter: &str,
        entity_type: EntityType,
    ) -> Result<Vec<SyncableRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE entity_type = ? {filter} ORDER BY id"
        ))?;
        let records = stmt
            .query_map(params![entity_type.as_str()], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Insert or replace every column of `record` as given
    fn write_record(conn: &Connection, record: &SyncableRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO records (entity_type, id, payload, updated_at, deleted_at, local_version,
                remote_version, last_remote_updated_at, dirty, sync_state, push_attempts,
                next_attempt_at, last_error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (entity_type, id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at,
                local_version = excluded.local_version,
                remote_version = excluded.remote_version,
                last_remote_updated_at = excluded.last_remote_updated_at,
                dirty = excluded.dirty,
                sync_state = excluded.sync_state,
                push_attempts = excluded.push_attempts,
                next_attempt_at = excluded.next_attempt_at,
                last_error = excluded.last_error",
            params![
                record.entity_type.as_str(),
                record.id.as_str(),
                serde_json::to_string(&record.payload)?,
                record.updated_at,
                record.deleted_at,
                record.local_version,
                record.remote_version,
                record.last_remote_updated_at,
                i32::from(record.dirty),
                record.sync_state.as_str(),
                i64::from(record.push_attempts),
                record.next_attempt_at,
                record.last_error,
            ],
        )?;
        Ok(())
    }

    fn select_migrations(conn: &Connection) -> Result<Vec<MigrationRecord>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, status, updated_at, error FROM migration_ledger ORDER BY id",
        )?;
        let records = stmt
            .query_map([], |row| {
                let status: String = row.get(2)?;
                Ok(MigrationRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    status: status.parse::<MigrationStatus>().map_err(|e| conversion_error(2, e))?,
                    updated_at: row.get(3)?,
                    error: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn write_migration_status(
        conn: &Connection,
        migration: &Migration,
        status: MigrationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO migration_ledger (id, name, status, updated_at, error)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                updated_at = excluded.updated_at,
                error = excluded.error",
            params![migration.id, migration.name, status.as_str(), now_ms(), error],
        )?;
        Ok(())
    }
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

fn parse_snapshot(raw: &str, column: usize) -> rusqlite::Result<RecordSnapshot> {
    serde_json::from_str(raw).map_err(|e| conversion_error(column, e.to_string()))
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn get(&self, entity_type: EntityType, id: &RecordId) -> Result<Option<SyncableRecord>> {
        self.with_connection(|conn| Self::select_record(conn, entity_type, id))
            .await
    }

    async fn get_all(&self, entity_type: EntityType) -> Result<Vec<SyncableRecord>> {
        self.with_connection(|conn| Self::select_records(conn, "", entity_type))
            .await
    }

    async fn get_dirty(&self, entity_type: EntityType) -> Result<Vec<SyncableRecord>> {
        self.with_connection(|conn| {
            Self::select_records(
                conn,
                "AND dirty = 1 AND sync_state <> 'conflict'",
                entity_type,
            )
        })
        .await
    }

    async fn upsert(&self, record: &SyncableRecord, dirty: bool) -> Result<SyncableRecord> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let existing = Self::select_record(&tx, record.entity_type, &record.id)?;

            let mut stored = record.clone();
            stored.local_version = existing
                .as_ref()
                .map_or(record.local_version, |current| current.local_version)
                + 1;
            stored.dirty = dirty;
            if dirty {
                let in_conflict = existing
                    .as_ref()
                    .is_some_and(|current| current.sync_state == SyncState::Conflict);
                stored.sync_state = if in_conflict {
                    SyncState::Conflict
                } else {
                    SyncState::PendingPush
                };
                stored.push_attempts = 0;
                stored.next_attempt_at = None;
                stored.last_error = None;
            } else {
                stored.sync_state = SyncState::Synced;
                stored.last_remote_updated_at =
                    record.last_remote_updated_at.or(Some(record.updated_at));
            }

            Self::write_record(&tx, &stored)?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn apply_remote(
        &self,
        record: &SyncableRecord,
        expected_version: Option<i64>,
    ) -> Result<bool> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let existing = Self::select_record(&tx, record.entity_type, &record.id)?;

            let next_version = match (existing, expected_version) {
                (None, None) => 1,
                (Some(current), Some(expected))
                    if current.local_version == expected && !current.dirty =>
                {
                    current.local_version + 1
                }
                _ => return Ok(false),
            };

            let stored = SyncableRecord {
                local_version: next_version,
                dirty: false,
                sync_state: SyncState::Synced,
                last_remote_updated_at: Some(record.updated_at),
                push_attempts: 0,
                next_attempt_at: None,
                last_error: None,
                ..record.clone()
            };
            Self::write_record(&tx, &stored)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn keep_local(
        &self,
        entity_type: EntityType,
        id: &RecordId,
        remote_updated_at: i64,
        expected_version: i64,
    ) -> Result<bool> {
        self.with_connection(|conn| {
            let rows = conn.execute(
                "UPDATE records SET
                    last_remote_updated_at = MAX(COALESCE(last_remote_updated_at, 0), ?),
                    sync_state = CASE sync_state
                        WHEN 'conflict' THEN 'conflict'
                        WHEN 'error' THEN 'error'
                        ELSE 'pending_push' END
                 WHERE entity_type = ? AND id = ? AND local_version = ? AND dirty = 1",
                params![
                    remote_updated_at,
                    entity_type.as_str(),
                    id.as_str(),
                    expected_version
                ],
            )?;
            Ok(rows > 0)
        })
        .await
    }

    async fn mark_synced(
        &self,
        entity_type: EntityType,
        id: &RecordId,
        ack: &PushAck,
    ) -> Result<bool> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let cleared = tx.execute(
                "UPDATE records SET
                    dirty = 0,
                    sync_state = 'synced',
                    remote_version = ?,
                    updated_at = ?,
                    last_remote_updated_at = ?,
                    push_attempts = 0,
                    next_attempt_at = NULL,
                    last_error = NULL
                 WHERE entity_type = ? AND id = ? AND local_version = ?",
                params![
                    ack.remote_version,
                    ack.remote_updated_at,
                    ack.remote_updated_at,
                    entity_type.as_str(),
                    id.as_str(),
                    ack.local_version
                ],
            )? > 0;

            if !cleared {
                // Superseded by a newer local edit: keep it dirty, but remember
                // what the remote now holds so our own echo is not a conflict.
                tx.execute(
                    "UPDATE records SET
                        remote_version = ?,
                        last_remote_updated_at = MAX(COALESCE(last_remote_updated_at, 0), ?)
                     WHERE entity_type = ? AND id = ?",
                    params![
                        ack.remote_version,
                        ack.remote_updated_at,
                        entity_type.as_str(),
                        id.as_str()
                    ],
                )?;
            }

            tx.commit()?;
            Ok(cleared)
        })
        .await
    }

    async fn mark_push_failed(
        &self,
        entity_type: EntityType,
        id: &RecordId,
        reason: &str,
        next_attempt_at: i64,
    ) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE records SET
                    sync_state = CASE sync_state WHEN 'conflict' THEN 'conflict' ELSE 'error' END,
                    push_attempts = push_attempts + 1,
                    next_attempt_at = ?,
                    last_error = ?
                 WHERE entity_type = ? AND id = ? AND dirty = 1",
                params![next_attempt_at, reason, entity_type.as_str(), id.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_cursor(&self, entity_type: EntityType) -> Result<SyncCursor> {
        self.with_connection(|conn| {
            let cursor = conn
                .query_row(
                    "SELECT updated_at, last_id FROM sync_cursors WHERE entity_type = ?",
                    params![entity_type.as_str()],
                    |row| {
                        let last_id: Option<String> = row.get(1)?;
                        Ok(SyncCursor::new(row.get(0)?, last_id.map(RecordId::from)))
                    },
                )
                .optional()?;
            Ok(cursor.unwrap_or_default())
        })
        .await
    }

    async fn set_cursor(&self, entity_type: EntityType, cursor: &SyncCursor) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sync_cursors (entity_type, updated_at, last_id) VALUES (?, ?, ?)
                 ON CONFLICT (entity_type) DO UPDATE SET
                    updated_at = excluded.updated_at,
                    last_id = excluded.last_id",
                params![
                    entity_type.as_str(),
                    cursor.updated_at,
                    cursor.last_id.as_ref().map(RecordId::as_str)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn count_pending(&self, entity_type: Option<EntityType>) -> Result<usize> {
        self.with_connection(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records
                 WHERE sync_state IN ('pending_push', 'error', 'conflict')
                   AND (?1 IS NULL OR entity_type = ?1)",
                params![entity_type.map(EntityType::as_str)],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn state_counts(&self, entity_type: EntityType) -> Result<HashMap<SyncState, usize>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sync_state, COUNT(*) FROM records WHERE entity_type = ? GROUP BY sync_state",
            )?;
            let counts = stmt
                .query_map(params![entity_type.as_str()], |row| {
                    let state: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    Ok((
                        state.parse::<SyncState>().map_err(|e| conversion_error(0, e))?,
                        count as usize,
                    ))
                })?
                .collect::<rusqlite::Result<HashMap<_, _>>>()?;
            Ok(counts)
        })
        .await
    }

    async fn open_conflict(&self, conflict: &ConflictRecord) -> Result<()> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO sync_conflicts (entity_type, id, local_snapshot, remote_snapshot, detected_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (entity_type, id) DO UPDATE SET
                    local_snapshot = excluded.local_snapshot,
                    remote_snapshot = excluded.remote_snapshot",
                params![
                    conflict.entity_type.as_str(),
                    conflict.id.as_str(),
                    serde_json::to_string(&conflict.local)?,
                    serde_json::to_string(&conflict.remote)?,
                    conflict.detected_at,
                ],
            )?;
            tx.execute(
                "UPDATE records SET sync_state = 'conflict' WHERE entity_type = ? AND id = ?",
                params![conflict.entity_type.as_str(), conflict.id.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_conflict(
        &self,
        entity_type: EntityType,
        id: &RecordId,
    ) -> Result<Option<ConflictRecord>> {
        self.with_connection(|conn| {
            let conflict = conn
                .query_row(
                    "SELECT entity_type, id, local_snapshot, remote_snapshot, detected_at
                     FROM sync_conflicts WHERE entity_type = ? AND id = ?",
                    params![entity_type.as_str(), id.as_str()],
                    Self::parse_conflict,
                )
                .optional()?;
            Ok(conflict)
        })
        .await
    }

    async fn list_conflicts(&self, entity_type: Option<EntityType>) -> Result<Vec<ConflictRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_type, id, local_snapshot, remote_snapshot, detected_at
                 FROM sync_conflicts
                 WHERE (?1 IS NULL OR entity_type = ?1)
                 ORDER BY detected_at, entity_type, id",
            )?;
            let conflicts = stmt
                .query_map(
                    params![entity_type.map(EntityType::as_str)],
                    Self::parse_conflict,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(conflicts)
        })
        .await
    }

    async fn commit_resolution(
        &self,
        record: &SyncableRecord,
        entry: &ConflictLogEntry,
        expected_version: Option<i64>,
        require_open_conflict: bool,
    ) -> Result<ResolutionWrite> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let current = Self::select_record(&tx, record.entity_type, &record.id)?;
            if current.as_ref().map(|current| current.local_version) != expected_version {
                return Ok(ResolutionWrite::Stale);
            }

            let closed = tx.execute(
                "DELETE FROM sync_conflicts WHERE entity_type = ? AND id = ?",
                params![record.entity_type.as_str(), record.id.as_str()],
            )? > 0;
            if require_open_conflict && !closed {
                return Ok(ResolutionWrite::NoOpenConflict);
            }

            let stored = SyncableRecord {
                local_version: expected_version.unwrap_or(0) + 1,
                ..record.clone()
            };
            Self::write_record(&tx, &stored)?;

            tx.execute(
                "INSERT INTO conflict_log
                    (entity_type, record_id, local_updated_at, incoming_updated_at, resolved_at, strategy)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    entry.entity_type.as_str(),
                    entry.record_id,
                    entry.local_updated_at,
                    entry.incoming_updated_at,
                    entry.resolved_at,
                    entry.strategy.as_str(),
                ],
            )?;
            tx.commit()?;
            Ok(ResolutionWrite::Committed)
        })
        .await
    }

    async fn list_conflict_log(&self, limit: usize) -> Result<Vec<ConflictLogEntry>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, entity_type, record_id, local_updated_at, incoming_updated_at,
                        resolved_at, strategy
                 FROM conflict_log
                 ORDER BY resolved_at DESC, id DESC
                 LIMIT ?",
            )?;
            let entries = stmt
                .query_map(params![limit as i64], |row| {
                    let entity_type: String = row.get(1)?;
                    let strategy: String = row.get(6)?;
                    Ok(ConflictLogEntry {
                        id: row.get(0)?,
                        entity_type: entity_type
                            .parse::<EntityType>()
                            .map_err(|e| conversion_error(1, e))?,
                        record_id: row.get(2)?,
                        local_updated_at: row.get(3)?,
                        incoming_updated_at: row.get(4)?,
                        resolved_at: row.get(5)?,
                        strategy: strategy
                            .parse::<ResolutionStrategy>()
                            .map_err(|e| conversion_error(6, e))?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn purge_tombstones(&self, older_than: i64) -> Result<usize> {
        self.with_connection(|conn| {
            let removed = conn.execute(
                "DELETE FROM records
                 WHERE deleted_at IS NOT NULL AND deleted_at < ?
                   AND dirty = 0 AND sync_state = 'synced'",
                params![older_than],
            )?;
            if removed > 0 {
                tracing::debug!("Purged {removed} acknowledged tombstones");
            }
            Ok(removed)
        })
        .await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM sync_meta WHERE key = ?",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sync_meta (key, value) VALUES (?, ?)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn migration_ledger(&self) -> Result<Vec<MigrationRecord>> {
        self.with_connection(|conn| Self::select_migrations(conn)).await
    }

    async fn set_migration_status(
        &self,
        migration: &Migration,
        status: MigrationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.with_connection(|conn| Self::write_migration_status(conn, migration, status, error))
            .await
    }

    async fn apply_migration(&self, migration: &Migration) -> Result<()> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            for statement in migration.statements {
                tx.execute_batch(statement)?;
            }
            Self::write_migration_status(&tx, migration, MigrationStatus::Applied, None)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MigrationRunner;
    use crate::models::{Payload, ResolutionStrategy};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> SqliteLocalStore {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        MigrationRunner::new(Arc::new(store.clone()))
            .check_and_run()
            .await
            .unwrap();
        store
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn habit(id: &str, name: &str) -> SyncableRecord {
        SyncableRecord::with_id(
            EntityType::Habits,
            RecordId::from(id),
            payload(json!({ "name": name })),
        )
    }

    #[tokio::test]
    async fn test_upsert_bumps_version_and_marks_dirty() {
        let store = setup().await;

        let first = store.upsert(&habit("H1", "Read"), true).await.unwrap();
        assert_eq!(first.local_version, 1);
        assert!(first.dirty);
        assert_eq!(first.sync_state, SyncState::PendingPush);

        let second = store.upsert(&habit("H1", "Read more"), true).await.unwrap();
        assert_eq!(second.local_version, 2);

        let fetched = store
            .get(EntityType::Habits, &RecordId::from("H1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, second);
    }

    #[tokio::test]
    async fn test_clean_upsert_is_synced() {
        let store = setup().await;
        let stored = store.upsert(&habit("H1", "Read"), false).await.unwrap();

        assert!(!stored.dirty);
        assert_eq!(stored.sync_state, SyncState::Synced);
        assert_eq!(stored.last_remote_updated_at, Some(stored.updated_at));
        assert!(store.get_dirty(EntityType::Habits).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_synced_requires_matching_version() {
        let store = setup().await;
        let id = RecordId::from("H1");
        let stored = store.upsert(&habit("H1", "Read"), true).await.unwrap();

        // A newer edit lands while the push is in flight
        store.upsert(&habit("H1", "Read twice"), true).await.unwrap();

        let stale = PushAck {
            local_version: stored.local_version,
            remote_version: "v1".to_string(),
            remote_updated_at: 500,
        };
        assert!(!store
            .mark_synced(EntityType::Habits, &id, &stale)
            .await
            .unwrap());

        let record = store.get(EntityType::Habits, &id).await.unwrap().unwrap();
        assert!(record.dirty);
        assert_eq!(record.remote_version.as_deref(), Some("v1"));
        assert_eq!(record.last_remote_updated_at, Some(500));

        let fresh = PushAck {
            local_version: record.local_version,
            remote_version: "v2".to_string(),
            remote_updated_at: 600,
        };
        assert!(store.mark_synced(EntityType::Habits, &id, &fresh).await.unwrap());
        let record = store.get(EntityType::Habits, &id).await.unwrap().unwrap();
        assert!(!record.dirty);
        assert_eq!(record.sync_state, SyncState::Synced);
        assert_eq!(record.updated_at, 600);
    }

    #[tokio::test]
    async fn test_apply_remote_is_guarded() {
        let store = setup().await;
        let mut remote = habit("H1", "Remote");
        remote.updated_at = 100;

        assert!(store.apply_remote(&remote, None).await.unwrap());
        // Row exists now, so an insert-only apply must not overwrite it
        assert!(!store.apply_remote(&remote, None).await.unwrap());

        let local = store
            .upsert(&habit("H1", "Local edit"), true)
            .await
            .unwrap();
        remote.updated_at = 200;
        assert!(!store
            .apply_remote(&remote, Some(local.local_version))
            .await
            .unwrap());

        let record = store
            .get(EntityType::Habits, &RecordId::from("H1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.payload["name"], "Local edit");
    }

    #[tokio::test]
    async fn test_push_failure_keeps_record_dirty() {
        let store = setup().await;
        let id = RecordId::from("H1");
        store.upsert(&habit("H1", "Read"), true).await.unwrap();

        store
            .mark_push_failed(EntityType::Habits, &id, "invalid payload", 9_000)
            .await
            .unwrap();

        let record = store.get(EntityType::Habits, &id).await.unwrap().unwrap();
        assert!(record.dirty);
        assert_eq!(record.sync_state, SyncState::Error);
        assert_eq!(record.push_attempts, 1);
        assert_eq!(record.next_attempt_at, Some(9_000));
        assert_eq!(record.last_error.as_deref(), Some("invalid payload"));
        assert_eq!(store.count_pending(None).await.unwrap(), 1);

        let counts = store.state_counts(EntityType::Habits).await.unwrap();
        assert_eq!(counts.get(&SyncState::Error), Some(&1));
        assert_eq!(counts.get(&SyncState::PendingPush), None);
    }

    #[tokio::test]
    async fn test_cursor_roundtrip() {
        let store = setup().await;
        assert_eq!(
            store.get_cursor(EntityType::Goals).await.unwrap(),
            SyncCursor::default()
        );

        let cursor = SyncCursor::new(42, Some(RecordId::from("G9")));
        store.set_cursor(EntityType::Goals, &cursor).await.unwrap();
        assert_eq!(store.get_cursor(EntityType::Goals).await.unwrap(), cursor);
        assert_eq!(
            store.get_cursor(EntityType::Tasks).await.unwrap(),
            SyncCursor::default()
        );
    }

    #[tokio::test]
    async fn test_conflict_excludes_record_from_dirty_set() {
        let store = setup().await;
        let local = store.upsert(&habit("H1", "Local"), true).await.unwrap();

        let conflict = ConflictRecord {
            entity_type: EntityType::Habits,
            id: local.id.clone(),
            local: RecordSnapshot::of_local(&local),
            remote: RecordSnapshot {
                payload: payload(json!({ "name": "Remote" })),
                updated_at: local.updated_at + 10,
                deleted_at: None,
                version: None,
            },
            detected_at: 1,
        };
        store.open_conflict(&conflict).await.unwrap();

        assert!(store.get_dirty(EntityType::Habits).await.unwrap().is_empty());
        assert_eq!(store.count_pending(Some(EntityType::Habits)).await.unwrap(), 1);
        assert_eq!(
            store
                .get_conflict(EntityType::Habits, &local.id)
                .await
                .unwrap(),
            Some(conflict)
        );

        // Editing a conflicted record keeps it in conflict
        let edited = store.upsert(&habit("H1", "Local 2"), true).await.unwrap();
        assert_eq!(edited.sync_state, SyncState::Conflict);
    }

    #[tokio::test]
    async fn test_commit_resolution_requires_open_conflict() {
        let store = setup().await;
        let record = store.upsert(&habit("H1", "Read"), true).await.unwrap();
        let entry = ConflictLogEntry {
            id: 0,
            entity_type: EntityType::Habits,
            record_id: "H1".to_string(),
            local_updated_at: record.updated_at,
            incoming_updated_at: record.updated_at,
            resolved_at: 5,
            strategy: ResolutionStrategy::ManualLocal,
        };

        let version = Some(record.local_version);
        assert_eq!(
            store.commit_resolution(&record, &entry, version, true).await.unwrap(),
            ResolutionWrite::NoOpenConflict
        );
        assert!(store.list_conflict_log(10).await.unwrap().is_empty());

        assert_eq!(
            store.commit_resolution(&record, &entry, version, false).await.unwrap(),
            ResolutionWrite::Committed
        );
        let log = store.list_conflict_log(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].strategy, ResolutionStrategy::ManualLocal);
    }

    #[tokio::test]
    async fn test_commit_resolution_skips_newer_local_edit() {
        let store = setup().await;
        let read = store.upsert(&habit("H1", "Read"), true).await.unwrap();
        let edited = store.upsert(&habit("H1", "Read twice"), true).await.unwrap();
        let entry = ConflictLogEntry {
            id: 0,
            entity_type: EntityType::Habits,
            record_id: "H1".to_string(),
            local_updated_at: read.updated_at,
            incoming_updated_at: read.updated_at,
            resolved_at: 5,
            strategy: ResolutionStrategy::Lww,
        };

        let settled = SyncableRecord {
            dirty: false,
            sync_state: SyncState::Synced,
            ..read.clone()
        };
        assert_eq!(
            store
                .commit_resolution(&settled, &entry, Some(read.local_version), false)
                .await
                .unwrap(),
            ResolutionWrite::Stale
        );

        let current = store.get(EntityType::Habits, &read.id).await.unwrap().unwrap();
        assert_eq!(current, edited);
        assert!(store.list_conflict_log(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_only_removes_acknowledged_tombstones() {
        let store = setup().await;

        let mut acked = habit("H1", "Gone");
        acked.deleted_at = Some(100);
        store.upsert(&acked, false).await.unwrap();

        let mut unacked = habit("H2", "Going");
        unacked.deleted_at = Some(100);
        store.upsert(&unacked, true).await.unwrap();

        assert_eq!(store.purge_tombstones(200).await.unwrap(), 1);
        let remaining = store.get_all(EntityType::Habits).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id.as_str(), "H2");
    }

    #[tokio::test]
    async fn test_meta_roundtrip() {
        let store = setup().await;
        assert_eq!(store.get_meta("last_sync_at").await.unwrap(), None);
        store.set_meta("last_sync_at", "123").await.unwrap();
        assert_eq!(
            store.get_meta("last_sync_at").await.unwrap().as_deref(),
            Some("123")
        );
    }
}
