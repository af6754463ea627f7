//! Sync orchestrator
//!
//! One cycle walks the collections in dependency order. Each collection is
//! pulled (rows after its cursor, classified record by record) and then its
//! due dirty records are pushed in batches. Cursors are committed only once
//! every collection has been visited. Network and local failures are caught
//! per collection; only migration failures and cancellation before start
//! fail the call.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::conflict::{self, PullAction, Winner};
use super::status::{StatusBroadcaster, Subscription};
use crate::config::{ConflictStrategy, SyncConfig};
use crate::db::{
    LocalStore, MigrationRecord, MigrationReport, MigrationRunner, PushAck, ResolutionWrite,
};
use crate::error::{Error, Result};
use crate::models::{
    ConflictLogEntry, ConflictRecord, EntityType, Payload, RecordId, ResolutionChoice,
    ResolutionStrategy, SyncCursor, SyncState, SyncableRecord,
};
use crate::remote::{
    reserved_payload_key, PushItem, PushOutcome, RemoteClient, RemoteError, RemoteRow,
};
use crate::state::{EntityStatus, SyncMetadata, SyncPhase, SyncStatusEvent};
use crate::util::now_ms;

const LAST_SYNC_AT_KEY: &str = "last_sync_at";
/// Attempts to apply one pulled row while local edits keep racing it
const APPLY_ATTEMPTS: usize = 3;

type CycleFuture = Shared<BoxFuture<'static, Result<SyncReport>>>;

/// Where one collection's cycle ended up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntityCycleState {
    #[default]
    Idle,
    Pulling,
    Pushing,
    Done,
    Error,
}

/// Counters for one collection in one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityReport {
    pub state: EntityCycleState,
    pub pulled: usize,
    pub inserted: usize,
    pub overwritten: usize,
    pub skipped: usize,
    pub kept_local: usize,
    /// Conflicts raised or refreshed
    pub conflicts: usize,
    /// Conflicts settled by last-write-wins
    pub auto_resolved: usize,
    pub pushed: usize,
    /// Accepted pushes superseded by a newer local edit
    pub stale_acks: usize,
    pub rejected: usize,
    /// Dirty records still waiting out their retry backoff
    pub deferred: usize,
    pub error: Option<String>,
}

/// Outcome of one `sync_all` cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub online: bool,
    /// Stopped before every collection was visited
    pub cancelled: bool,
    pub entities: BTreeMap<EntityType, EntityReport>,
}

impl SyncReport {
    pub fn conflicts(&self) -> usize {
        self.entities.values().map(|entity| entity.conflicts).sum()
    }

    /// Collections that failed a phase plus rejected records
    pub fn errors(&self) -> usize {
        self.entities
            .values()
            .map(|entity| usize::from(entity.error.is_some()) + entity.rejected)
            .sum()
    }

    pub fn pushed(&self) -> usize {
        self.entities.values().map(|entity| entity.pushed).sum()
    }

    pub fn pulled(&self) -> usize {
        self.entities
            .values()
            .map(|entity| entity.inserted + entity.overwritten + entity.auto_resolved)
            .sum()
    }

    pub fn is_clean(&self) -> bool {
        self.online && !self.cancelled && self.conflicts() == 0 && self.errors() == 0
    }
}

/// Cancels further network calls of an engine
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct EngineInner {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    config: SyncConfig,
    migrations: MigrationRunner,
    status: StatusBroadcaster,
    metadata: RwLock<SyncMetadata>,
    /// Collections whose last cycle failed a phase or had a rejection
    failed: Mutex<BTreeSet<EntityType>>,
    in_flight: Mutex<Option<CycleFuture>>,
    stop: StopHandle,
}

/// Session-scoped sync context shared by every consumer
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        config: SyncConfig,
    ) -> Self {
        let migrations = MigrationRunner::new(Arc::clone(&store));
        Self::with_migrations(store, remote, config, migrations)
    }

    /// Engine gated on a custom migration runner
    pub fn with_migrations(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        config: SyncConfig,
        migrations: MigrationRunner,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                remote,
                config,
                migrations,
                status: StatusBroadcaster::new(),
                metadata: RwLock::new(SyncMetadata::default()),
                failed: Mutex::new(BTreeSet::new()),
                in_flight: Mutex::new(None),
                stop: StopHandle {
                    stopped: Arc::new(AtomicBool::new(false)),
                    notify: Arc::new(Notify::new()),
                },
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.inner.store
    }

    /// Apply pending migrations; fails with [`Error::FatalMigration`]
    pub async fn check_and_run_migrations(&self) -> Result<MigrationReport> {
        self.inner.migrations.check_and_run().await
    }

    pub async fn migration_status(&self) -> Result<Vec<MigrationRecord>> {
        self.inner.migrations.status().await
    }

    /// Reset a failed migration so the next run retries it
    pub async fn clear_migration_failure(&self, id: u32) -> Result<()> {
        self.inner.migrations.clear_failure(id).await
    }

    /// Run one sync cycle, or join the cycle already running.
    ///
    /// Every concurrent caller receives the outcome of the same cycle.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let cycle = {
            let mut slot = self.inner.in_flight.lock();
            if let Some(cycle) = slot.as_ref() {
                tracing::debug!("Joining in-flight sync cycle");
                cycle.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move {
                    let result = inner.run_cycle().await;
                    inner.in_flight.lock().take();
                    result
                });
                let cycle = async move {
                    task.await.unwrap_or_else(|error| {
                        Err(Error::Io(format!("sync task failed: {error}")))
                    })
                }
                .boxed()
                .shared();
                *slot = Some(cycle.clone());
                cycle
            }
        };
        cycle.await
    }

    /// Register a status observer
    pub fn on_sync_status_change(
        &self,
        callback: impl Fn(&SyncStatusEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.status.subscribe(callback)
    }

    /// Point-in-time metadata snapshot; never blocks on a running cycle
    pub fn get_sync_metadata(&self) -> SyncMetadata {
        self.inner.metadata.read().clone()
    }

    /// Recompute pending counts and per-collection status from the store
    pub async fn refresh_metadata(&self) -> Result<SyncMetadata> {
        self.inner.refresh_metadata(None).await
    }

    /// Settle an open conflict, keeping the local or the remote side
    pub async fn resolve_conflict(
        &self,
        entity_type: EntityType,
        id: &RecordId,
        choice: ResolutionChoice,
    ) -> Result<SyncableRecord> {
        let store = &self.inner.store;
        let not_found = || Error::ConflictNotFound {
            entity_type,
            id: id.to_string(),
        };

        for _ in 0..APPLY_ATTEMPTS {
            let conflict = store.get_conflict(entity_type, id).await?.ok_or_else(not_found)?;
            // The local copy may have been edited after detection
            let current = store.get(entity_type, id).await?;
            let expected = current.as_ref().map(|record| record.local_version);
            let local = current.unwrap_or_else(|| record_from_conflict(&conflict));

            let now = now_ms();
            let settled = match choice {
                ResolutionChoice::Local => conflict::keep_local(&local, &conflict.remote, now),
                ResolutionChoice::Remote => conflict::take_remote(&local, &conflict.remote),
            };
            let entry = conflict::log_entry(&local, &conflict.remote, choice.into(), now);
            match store.commit_resolution(&settled, &entry, expected, true).await? {
                ResolutionWrite::Committed => {}
                ResolutionWrite::NoOpenConflict => return Err(not_found()),
                ResolutionWrite::Stale => {
                    tracing::debug!("{entity_type}/{id} edited while resolving, retrying");
                    continue;
                }
            }
            tracing::info!("Resolved conflict on {entity_type}/{id} keeping {choice:?}");

            self.inner.refresh_metadata(None).await?;
            return store
                .get(entity_type, id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("{entity_type}/{id}")));
        }

        Err(Error::Database(format!(
            "{entity_type}/{id} kept changing while resolving its conflict"
        )))
    }

    pub async fn list_conflicts(
        &self,
        entity_type: Option<EntityType>,
    ) -> Result<Vec<ConflictRecord>> {
        self.inner.store.list_conflicts(entity_type).await
    }

    /// Most recent resolutions, newest first
    pub async fn conflict_log(&self, limit: usize) -> Result<Vec<ConflictLogEntry>> {
        self.inner.store.list_conflict_log(limit).await
    }

    /// Create or edit a record locally; it is pushed on the next cycle
    pub async fn save_local(
        &self,
        entity_type: EntityType,
        id: Option<RecordId>,
        payload: Payload,
    ) -> Result<SyncableRecord> {
        if let Some(key) = reserved_payload_key(&payload) {
            return Err(Error::InvalidInput(format!(
                "payload field '{key}' is reserved for sync metadata"
            )));
        }
        let id = id.unwrap_or_default();
        let record = SyncableRecord::with_id(entity_type, id, payload);
        self.check_parent(&record).await?;

        let existing = self.inner.store.get(entity_type, &record.id).await?;
        let record = match existing {
            Some(current) => SyncableRecord {
                payload: record.payload,
                updated_at: record.updated_at.max(current.updated_at + 1),
                deleted_at: None,
                ..current
            },
            None => record,
        };

        let stored = self.inner.store.upsert(&record, true).await?;
        tracing::debug!("Saved {entity_type}/{} v{}", stored.id, stored.local_version);
        self.inner.refresh_metadata(None).await?;
        Ok(stored)
    }

    /// Mark a record deleted; the tombstone stays until the remote acknowledges it
    pub async fn delete_local(
        &self,
        entity_type: EntityType,
        id: &RecordId,
    ) -> Result<SyncableRecord> {
        let current = self
            .inner
            .store
            .get(entity_type, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type}/{id}")))?;
        if current.is_tombstone() {
            return Ok(current);
        }

        let now = now_ms().max(current.updated_at + 1);
        let record = SyncableRecord {
            updated_at: now,
            deleted_at: Some(now),
            ..current
        };
        let stored = self.inner.store.upsert(&record, true).await?;
        self.inner.refresh_metadata(None).await?;
        Ok(stored)
    }

    /// Remove acknowledged tombstones deleted before `older_than` (Unix ms)
    pub async fn purge_tombstones(&self, older_than: i64) -> Result<usize> {
        self.inner.store.purge_tombstones(older_than).await
    }

    /// Run `sync_all` every `interval` until stopped
    pub fn spawn_periodic_sync(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let notify = Arc::clone(&engine.inner.stop.notify);
                let stopped = notify.notified();
                if engine.is_stopped() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = stopped => break,
                }

                match engine.sync_all().await {
                    Ok(report) if report.cancelled => break,
                    Ok(_) => {}
                    Err(Error::Cancelled) => break,
                    Err(error) if !error.is_recoverable() => {
                        tracing::error!("Periodic sync halted: {error}");
                        break;
                    }
                    Err(error) => tracing::warn!("Periodic sync failed: {error}"),
                }
            }
            tracing::debug!("Periodic sync stopped");
        })
    }

    /// Stop issuing network calls; a running cycle ends after its current call
    pub fn stop(&self) {
        self.inner.stop.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_stopped()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.inner.stop.clone()
    }

    async fn check_parent(&self, record: &SyncableRecord) -> Result<()> {
        let (Some(parent_type), Some(parent_id)) = (record.entity_type.parent(), record.parent_id())
        else {
            return Ok(());
        };
        let parent = self
            .inner
            .store
            .get(parent_type, &RecordId::from(parent_id))
            .await?;
        match parent {
            Some(parent) if !parent.is_tombstone() => Ok(()),
            _ => Err(Error::InvalidInput(format!(
                "{} references missing {parent_type}/{parent_id}",
                record.entity_type
            ))),
        }
    }
}

impl EngineInner {
    async fn run_cycle(&self) -> Result<SyncReport> {
        if self.stop.is_stopped() {
            return Err(Error::Cancelled);
        }

        if let Err(error) = self.migrations.check_and_run().await {
            tracing::error!("Sync blocked: {error}");
            self.status.emit(SyncStatusEvent::error(error.to_string()));
            return Err(error);
        }

        tracing::info!("Sync cycle started");
        self.status.emit(SyncStatusEvent::syncing(0, None, None));

        let mut report = SyncReport::default();
        if let Err(error) = self.call(self.remote.probe()).await {
            tracing::warn!("Remote unreachable, staying offline: {error}");
            self.set_online(false);
            self.refresh_metadata(Some(&report))
                .await
                .map_err(|error| self.fail_cycle(error))?;
            self.status
                .emit(SyncStatusEvent::error(format!("Offline: {error}")));
            return Ok(report);
        }
        self.set_online(true);
        report.online = true;

        let total = EntityType::SYNC_ORDER.len() * 2;
        let mut cursors: Vec<(EntityType, SyncCursor)> = Vec::new();

        for (index, entity_type) in EntityType::SYNC_ORDER.into_iter().enumerate() {
            if self.stop.is_stopped() {
                report.cancelled = true;
                break;
            }

            self.set_entity_status(entity_type, EntityStatus::Syncing);
            let mut entity = EntityReport::default();
            let outcome = self
                .sync_entity(entity_type, index * 2, total, &mut entity)
                .await;
            match outcome {
                Ok(Some(cursor)) => {
                    entity.state = EntityCycleState::Done;
                    cursors.push((entity_type, cursor));
                }
                Ok(None) => report.cancelled = true,
                Err(error) => {
                    tracing::warn!("Sync of {entity_type} failed: {error}");
                    entity.state = EntityCycleState::Error;
                    entity.error = Some(error.to_string());
                    if matches!(error, Error::Network(_)) {
                        self.set_online(false);
                        report.online = false;
                    }
                }
            }
            report.entities.insert(entity_type, entity);
        }

        let metadata = self
            .commit_cycle(&report, cursors)
            .await
            .map_err(|error| self.fail_cycle(error))?;
        if report.cancelled {
            tracing::info!("Sync cycle stopped early");
            self.status.emit(SyncStatusEvent::idle());
        } else if report.errors() > 0 || report.conflicts() > 0 || !report.online {
            let message = format!(
                "Sync finished with {} errors and {} conflicts",
                report.errors(),
                report.conflicts()
            );
            tracing::warn!("{message}");
            self.status.emit(SyncStatusEvent::error(message));
        } else {
            tracing::info!(
                "Sync cycle finished: {} pulled, {} pushed, {} pending",
                report.pulled(),
                report.pushed(),
                metadata.pending_changes
            );
            self.status.emit(SyncStatusEvent::success(format!(
                "Synced {} changes",
                report.pulled() + report.pushed()
            )));
        }
        Ok(report)
    }

    /// Commit the finished collections' cursors and rebuild metadata
    async fn commit_cycle(
        &self,
        report: &SyncReport,
        cursors: Vec<(EntityType, SyncCursor)>,
    ) -> Result<SyncMetadata> {
        for (entity_type, cursor) in cursors {
            self.store.set_cursor(entity_type, &cursor).await?;
        }
        self.refresh_metadata(Some(report)).await
    }

    /// Close a cycle that failed after it started: no collection is left
    /// syncing and observers get a final error event
    fn fail_cycle(&self, error: Error) -> Error {
        tracing::error!("Sync cycle failed: {error}");
        {
            let mut metadata = self.metadata.write();
            for status in metadata.entity_status.values_mut() {
                if *status == EntityStatus::Syncing {
                    *status = EntityStatus::Error;
                }
            }
        }
        self.status.emit(SyncStatusEvent::error(error.to_string()));
        error
    }

    /// Pull then push one collection.
    ///
    /// Returns the cursor to commit, or `None` when stopped part way.
    async fn sync_entity(
        &self,
        entity_type: EntityType,
        completed_phases: usize,
        total_phases: usize,
        report: &mut EntityReport,
    ) -> Result<Option<SyncCursor>> {
        report.state = EntityCycleState::Pulling;
        self.status.emit(SyncStatusEvent::syncing(
            progress(completed_phases, total_phases),
            Some(entity_type),
            Some(SyncPhase::Pulling),
        ));
        let Some(cursor) = self.pull_entity(entity_type, report).await? else {
            return Ok(None);
        };

        report.state = EntityCycleState::Pushing;
        self.status.emit(SyncStatusEvent::syncing(
            progress(completed_phases + 1, total_phases),
            Some(entity_type),
            Some(SyncPhase::Pushing),
        ));
        if !self.push_entity(entity_type, report).await? {
            return Ok(None);
        }
        Ok(Some(cursor))
    }

    async fn pull_entity(
        &self,
        entity_type: EntityType,
        report: &mut EntityReport,
    ) -> Result<Option<SyncCursor>> {
        let mut cursor = self.store.get_cursor(entity_type).await?;
        let limit = self.config.pull_page_size.max(1);

        loop {
            if self.stop.is_stopped() {
                return Ok(None);
            }
            let page = self.call(self.remote.pull(entity_type, &cursor, limit)).await?;
            tracing::debug!("Pulled {} {entity_type} rows after {:?}", page.len(), cursor);

            let start = cursor.clone();
            for row in &page {
                if !cursor.is_before(row.updated_at, &row.id) {
                    continue;
                }
                self.apply_row(entity_type, row, report).await?;
                report.pulled += 1;
                cursor.advance(row.updated_at, &row.id);
            }

            if page.len() < limit {
                return Ok(Some(cursor));
            }
            if cursor == start {
                return Err(Error::Remote {
                    status: 0,
                    message: format!("{entity_type} page did not advance past the cursor"),
                });
            }
        }
    }

    async fn apply_row(
        &self,
        entity_type: EntityType,
        row: &RemoteRow,
        report: &mut EntityReport,
    ) -> Result<()> {
        for _ in 0..APPLY_ATTEMPTS {
            let local = self.store.get(entity_type, &row.id).await?;
            let applied = match conflict::classify(local.as_ref(), row) {
                PullAction::Insert => {
                    let inserted = self
                        .store
                        .apply_remote(&row.to_record(entity_type), None)
                        .await?;
                    report.inserted += usize::from(inserted);
                    inserted
                }
                PullAction::Skip => {
                    report.skipped += 1;
                    true
                }
                PullAction::Overwrite => {
                    let expected = local.as_ref().map(|record| record.local_version);
                    let overwritten = self
                        .store
                        .apply_remote(&row.to_record(entity_type), expected)
                        .await?;
                    report.overwritten += usize::from(overwritten);
                    overwritten
                }
                PullAction::KeepLocal => {
                    let version = local.as_ref().map_or(0, |record| record.local_version);
                    let kept = self
                        .store
                        .keep_local(entity_type, &row.id, row.updated_at, version)
                        .await?;
                    report.kept_local += usize::from(kept);
                    kept
                }
                PullAction::Conflict => match local {
                    Some(local) => self.handle_conflict(&local, row, report).await?,
                    None => false,
                },
                PullAction::RefreshConflict => match local {
                    Some(local) => {
                        self.refresh_conflict(&local, row, report).await?;
                        true
                    }
                    None => false,
                },
            };
            if applied {
                return Ok(());
            }
        }

        Err(Error::Database(format!(
            "{entity_type}/{} kept changing while applying a pulled row",
            row.id
        )))
    }

    /// Open a conflict or settle it by last-write-wins.
    ///
    /// Returns false when the local record moved before the settled copy
    /// could be written.
    async fn handle_conflict(
        &self,
        local: &SyncableRecord,
        row: &RemoteRow,
        report: &mut EntityReport,
    ) -> Result<bool> {
        let now = now_ms();
        match self.config.conflict_strategy {
            ConflictStrategy::Manual => {
                tracing::warn!(
                    "Conflict on {}/{}: local {} vs remote {}",
                    local.entity_type,
                    local.id,
                    local.updated_at,
                    row.updated_at
                );
                self.store
                    .open_conflict(&conflict::new_conflict(local, row, now))
                    .await?;
                report.conflicts += 1;
            }
            ConflictStrategy::LastWriteWins => {
                let remote = conflict::snapshot_of_remote(row);
                let settled = match conflict::last_write_wins(local.updated_at, row.updated_at) {
                    Winner::Local => conflict::keep_local(local, &remote, now),
                    Winner::Remote => conflict::take_remote(local, &remote),
                };
                let entry = conflict::log_entry(local, &remote, ResolutionStrategy::Lww, now);
                let written = self
                    .store
                    .commit_resolution(&settled, &entry, Some(local.local_version), false)
                    .await?;
                if written == ResolutionWrite::Stale {
                    return Ok(false);
                }
                tracing::debug!(
                    "Auto-resolved {}/{} keeping {}",
                    local.entity_type,
                    local.id,
                    if settled.dirty { "local" } else { "remote" }
                );
                report.auto_resolved += 1;
            }
        }
        Ok(true)
    }

    async fn refresh_conflict(
        &self,
        local: &SyncableRecord,
        row: &RemoteRow,
        report: &mut EntityReport,
    ) -> Result<()> {
        let existing = self.store.get_conflict(local.entity_type, &local.id).await?;
        let conflict = match existing {
            Some(conflict) if row.updated_at <= conflict.remote.updated_at => return Ok(()),
            Some(conflict) => ConflictRecord {
                remote: conflict::snapshot_of_remote(row),
                ..conflict
            },
            None => conflict::new_conflict(local, row, now_ms()),
        };
        self.store.open_conflict(&conflict).await?;
        report.conflicts += 1;
        Ok(())
    }

    /// Push due dirty records; returns false when stopped part way
    async fn push_entity(
        &self,
        entity_type: EntityType,
        report: &mut EntityReport,
    ) -> Result<bool> {
        let now = now_ms();
        let (due, waiting): (Vec<SyncableRecord>, Vec<SyncableRecord>) = self
            .store
            .get_dirty(entity_type)
            .await?
            .into_iter()
            .partition(|record| record.is_push_due(now));
        report.deferred = waiting.len();

        for chunk in due.chunks(self.config.push_batch_size.max(1)) {
            if self.stop.is_stopped() {
                return Ok(false);
            }

            let batch: Vec<PushItem> = chunk.iter().map(PushItem::from).collect();
            let outcomes = self.call(self.remote.push(entity_type, &batch)).await?;
            let mut by_id: HashMap<RecordId, PushOutcome> = outcomes
                .into_iter()
                .map(|outcome| (outcome.id().clone(), outcome))
                .collect();

            for record in chunk {
                match by_id.remove(&record.id) {
                    Some(PushOutcome::Accepted {
                        remote_version,
                        updated_at,
                        ..
                    }) => {
                        let ack = PushAck {
                            local_version: record.local_version,
                            remote_version,
                            remote_updated_at: updated_at,
                        };
                        if self.store.mark_synced(entity_type, &record.id, &ack).await? {
                            report.pushed += 1;
                        } else {
                            tracing::debug!(
                                "Stale ack for {entity_type}/{}: edited during push",
                                record.id
                            );
                            report.stale_acks += 1;
                        }
                    }
                    Some(PushOutcome::Rejected { reason, .. }) => {
                        self.reject(record, &reason, report).await?;
                    }
                    None => {
                        self.reject(record, "no outcome returned for record", report)
                            .await?;
                    }
                }
            }
        }
        Ok(true)
    }

    async fn reject(
        &self,
        record: &SyncableRecord,
        reason: &str,
        report: &mut EntityReport,
    ) -> Result<()> {
        let error = Error::RemoteRejected {
            id: record.id.to_string(),
            reason: reason.to_string(),
        };
        tracing::warn!("{} ({})", error, record.entity_type);

        let delay = self.config.retry.delay_for_attempt(record.push_attempts + 1);
        let next_attempt_at =
            now_ms().saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
        self.store
            .mark_push_failed(record.entity_type, &record.id, reason, next_attempt_at)
            .await?;
        report.rejected += 1;
        Ok(())
    }

    /// Run a remote call under the request timeout
    async fn call<T>(
        &self,
        request: impl std::future::Future<Output = std::result::Result<T, RemoteError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.request_timeout(), request).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Network(format!(
                "request timed out after {}s",
                self.config.request_timeout_secs
            ))),
        }
    }

    fn set_online(&self, online: bool) {
        self.metadata.write().is_online = online;
    }

    fn set_entity_status(&self, entity_type: EntityType, status: EntityStatus) {
        self.metadata.write().entity_status.insert(entity_type, status);
    }

    /// Rebuild the metadata snapshot; `report` is the cycle just finished
    async fn refresh_metadata(&self, report: Option<&SyncReport>) -> Result<SyncMetadata> {
        if let Some(report) = report {
            let mut failed = self.failed.lock();
            for (entity_type, entity) in &report.entities {
                if entity.error.is_some() || entity.rejected > 0 {
                    failed.insert(*entity_type);
                } else {
                    failed.remove(entity_type);
                }
            }
        }
        let failed = self.failed.lock().clone();

        let mut entity_status = BTreeMap::new();
        for entity_type in EntityType::SYNC_ORDER {
            let counts = self.store.state_counts(entity_type).await?;
            let count = |state: SyncState| counts.get(&state).copied().unwrap_or(0);
            let status = if failed.contains(&entity_type) || count(SyncState::Error) > 0 {
                EntityStatus::Error
            } else if count(SyncState::Conflict) > 0 {
                EntityStatus::Conflict
            } else if count(SyncState::PendingPush) > 0 {
                EntityStatus::Pending
            } else {
                EntityStatus::Synced
            };
            entity_status.insert(entity_type, status);
        }
        let pending_changes = self.store.count_pending(None).await?;
        let open_conflicts = entity_status
            .values()
            .any(|status| *status == EntityStatus::Conflict);

        let mut last_sync_at = match self.store.get_meta(LAST_SYNC_AT_KEY).await? {
            Some(value) => value.parse::<i64>().ok(),
            None => None,
        };
        if report.is_some_and(|report| report.is_clean() && !open_conflicts) {
            let now = now_ms();
            self.store.set_meta(LAST_SYNC_AT_KEY, &now.to_string()).await?;
            last_sync_at = Some(now);
        }

        let mut metadata = self.metadata.write();
        metadata.pending_changes = pending_changes;
        metadata.entity_status = entity_status;
        metadata.last_sync_at = last_sync_at;
        Ok(metadata.clone())
    }
}

fn progress(completed: usize, total: usize) -> u8 {
    u8::try_from(completed * 100 / total.max(1)).unwrap_or(100)
}

fn record_from_conflict(conflict: &ConflictRecord) -> SyncableRecord {
    SyncableRecord {
        payload: conflict.local.payload.clone(),
        updated_at: conflict.local.updated_at,
        deleted_at: conflict.local.deleted_at,
        remote_version: conflict.local.version.clone(),
        sync_state: SyncState::Conflict,
        ..SyncableRecord::with_id(conflict.entity_type, conflict.id.clone(), Payload::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteLocalStore;
    use crate::remote::MemoryRemote;
    use crate::state::SyncEventKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    async fn setup(config: SyncConfig) -> (SyncEngine, Arc<MemoryRemote>) {
        let store = Arc::new(SqliteLocalStore::open_in_memory().unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let engine = SyncEngine::new(store, remote.clone(), config);
        engine.check_and_run_migrations().await.unwrap();
        (engine, remote)
    }

    #[test]
    fn progress_is_bounded() {
        assert_eq!(progress(0, 14), 0);
        assert_eq!(progress(7, 14), 50);
        assert_eq!(progress(14, 14), 100);
        assert_eq!(progress(1, 0), 100);
    }

    #[tokio::test]
    async fn test_save_local_bumps_version_and_pending() {
        let (engine, _remote) = setup(SyncConfig::default()).await;
        let id = RecordId::from("H1");

        let first = engine
            .save_local(EntityType::Habits, Some(id.clone()), payload(json!({ "name": "Read" })))
            .await
            .unwrap();
        let second = engine
            .save_local(EntityType::Habits, Some(id), payload(json!({ "name": "Read daily" })))
            .await
            .unwrap();

        assert_eq!(first.local_version, 1);
        assert_eq!(second.local_version, 2);
        assert!(second.updated_at > first.updated_at);
        let metadata = engine.get_sync_metadata();
        assert_eq!(metadata.pending_changes, 1);
        assert_eq!(
            metadata.entity_status[&EntityType::Habits],
            EntityStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_save_local_requires_parent() {
        let (engine, _remote) = setup(SyncConfig::default()).await;

        let error = engine
            .save_local(
                EntityType::HabitCompletions,
                None,
                payload(json!({ "habit_id": "missing", "date": "2026-01-01" })),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_save_local_rejects_envelope_fields() {
        let (engine, _remote) = setup(SyncConfig::default()).await;

        for field in ["id", "updatedAt", "localVersion"] {
            let mut fields = payload(json!({ "name": "Read" }));
            fields.insert(field.to_string(), json!(1));
            let error = engine
                .save_local(EntityType::Habits, None, fields)
                .await
                .unwrap_err();
            assert!(matches!(error, Error::InvalidInput(message) if message.contains(field)));
        }

        // Snake-case fields are plain payload
        engine
            .save_local(
                EntityType::Habits,
                None,
                payload(json!({ "name": "Read", "updated_at": 1 })),
            )
            .await
            .unwrap();
        assert_eq!(engine.get_sync_metadata().pending_changes, 1);
    }

    #[tokio::test]
    async fn test_delete_local_keeps_tombstone_until_pushed() {
        let (engine, remote) = setup(SyncConfig::default()).await;
        let id = RecordId::from("T1");
        engine
            .save_local(EntityType::Tasks, Some(id.clone()), payload(json!({ "title": "Plan" })))
            .await
            .unwrap();
        engine.sync_all().await.unwrap();

        let tombstone = engine.delete_local(EntityType::Tasks, &id).await.unwrap();
        assert!(tombstone.is_tombstone());
        assert!(tombstone.dirty);

        engine.sync_all().await.unwrap();
        let local = engine
            .store()
            .get(EntityType::Tasks, &id)
            .await
            .unwrap()
            .unwrap();
        assert!(local.is_tombstone());
        assert!(!local.dirty);
        assert!(remote.row(EntityType::Tasks, &id).unwrap().deleted_at.is_some());

        let purged = engine.purge_tombstones(now_ms() + 60_000).await.unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn test_status_events_follow_cycle() {
        let (engine, _remote) = setup(SyncConfig::default()).await;
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription =
            engine.on_sync_status_change(move |event| sink.lock().push(event.clone()));

        engine.sync_all().await.unwrap();
        assert!(subscription.unsubscribe());

        let events = events.lock();
        assert_eq!(events.first().unwrap().kind, SyncEventKind::Syncing);
        assert_eq!(events.first().unwrap().progress, Some(0));
        assert_eq!(events.last().unwrap().kind, SyncEventKind::Success);
        // Pulling and pushing per collection, plus start and finish
        assert_eq!(events.len(), EntityType::SYNC_ORDER.len() * 2 + 2);
        assert!(events.windows(2).all(|pair| pair[0] != pair[1]));
    }

    #[tokio::test]
    async fn test_last_write_wins_resolves_automatically() {
        let config = SyncConfig {
            conflict_strategy: ConflictStrategy::LastWriteWins,
            ..SyncConfig::default()
        };
        let (engine, remote) = setup(config).await;
        let id = RecordId::from("G1");

        remote.seed(
            EntityType::Goals,
            RemoteRow {
                id: id.clone(),
                updated_at: 0,
                deleted_at: None,
                version: None,
                payload: payload(json!({ "title": "v1" })),
            },
        );
        engine.sync_all().await.unwrap();

        engine
            .save_local(EntityType::Goals, Some(id.clone()), payload(json!({ "title": "local" })))
            .await
            .unwrap();
        remote.seed(
            EntityType::Goals,
            RemoteRow {
                id: id.clone(),
                updated_at: now_ms() + 60_000,
                deleted_at: None,
                version: None,
                payload: payload(json!({ "title": "remote" })),
            },
        );

        let report = engine.sync_all().await.unwrap();
        assert_eq!(report.conflicts(), 0);
        assert_eq!(report.entities[&EntityType::Goals].auto_resolved, 1);

        let local = engine
            .store()
            .get(EntityType::Goals, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.payload["title"], "remote");
        assert!(!local.dirty);

        let log = engine.conflict_log(10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].strategy, ResolutionStrategy::Lww);
    }
}
