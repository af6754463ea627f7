//! In-process remote store.
//!
//! Behaves like the sync API: the server assigns a strictly increasing
//! `updated_at` (never below the client's), pushes are idempotent per
//! `(id, local_version)`, and pages are ordered by `(updated_at, id)`.
//! Faults can be injected for offline, rejection and server-error paths.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PushItem, PushOutcome, RemoteClient, RemoteError, RemoteResult, RemoteRow};
use crate::models::{EntityType, RecordId, SyncCursor};
use crate::util::now_ms;

/// Number of calls received per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub probe: usize,
    pub pull: usize,
    pub push: usize,
}

impl CallCounts {
    pub const fn total(&self) -> usize {
        self.probe + self.pull + self.push
    }
}

#[derive(Default)]
struct State {
    tables: BTreeMap<EntityType, BTreeMap<RecordId, RemoteRow>>,
    /// Outcomes already returned, keyed by the push idempotency key
    applied: HashMap<(EntityType, RecordId, i64), PushOutcome>,
    high_water: i64,
    next_version: u64,
    offline: bool,
    server_error: Option<(u16, String)>,
    rejections: HashMap<RecordId, String>,
    latency: Option<Duration>,
    calls: CallCounts,
}

impl State {
    fn next_timestamp(&mut self, requested: i64) -> i64 {
        self.high_water = requested.max(self.high_water + 1).max(now_ms());
        self.high_water
    }

    fn check_faults(&self) -> RemoteResult<()> {
        if self.offline {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        if let Some((status, message)) = &self.server_error {
            return Err(RemoteError::Server {
                status: *status,
                message: message.clone(),
            });
        }
        Ok(())
    }

    fn write(&mut self, entity_type: EntityType, item: &PushItem) -> PushOutcome {
        let key = (entity_type, item.id.clone(), item.local_version);
        if let Some(outcome) = self.applied.get(&key) {
            return outcome.clone();
        }
        if let Some(reason) = self.rejections.get(&item.id) {
            return PushOutcome::Rejected {
                id: item.id.clone(),
                reason: reason.clone(),
            };
        }

        let updated_at = self.next_timestamp(item.updated_at);
        self.next_version += 1;
        let version = self.next_version.to_string();
        self.tables.entry(entity_type).or_default().insert(
            item.id.clone(),
            RemoteRow {
                id: item.id.clone(),
                updated_at,
                deleted_at: item.deleted_at,
                version: Some(version.clone()),
                payload: item.payload.clone(),
            },
        );

        let outcome = PushOutcome::Accepted {
            id: item.id.clone(),
            remote_version: version,
            updated_at,
        };
        self.applied.insert(key, outcome.clone());
        outcome
    }
}

/// Remote store held in memory
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a row as another device would, returning the stored copy
    pub fn seed(&self, entity_type: EntityType, row: RemoteRow) -> RemoteRow {
        let mut state = self.state.lock();
        let mut row = row;
        row.updated_at = state.next_timestamp(row.updated_at);
        state.next_version += 1;
        row.version = Some(state.next_version.to_string());
        state
            .tables
            .entry(entity_type)
            .or_default()
            .insert(row.id.clone(), row.clone());
        row
    }

    pub fn row(&self, entity_type: EntityType, id: &RecordId) -> Option<RemoteRow> {
        self.state
            .lock()
            .tables
            .get(&entity_type)
            .and_then(|table| table.get(id))
            .cloned()
    }

    /// Rows of one collection ordered by id
    pub fn rows(&self, entity_type: EntityType) -> Vec<RemoteRow> {
        self.state
            .lock()
            .tables
            .get(&entity_type)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Make every call fail as unreachable
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Fail pull and push with a server error; probes still succeed
    pub fn set_server_error(&self, error: Option<(u16, String)>) {
        self.state.lock().server_error = error;
    }

    /// Reject every push of `id` with `reason`
    pub fn reject(&self, id: impl Into<RecordId>, reason: impl Into<String>) {
        self.state.lock().rejections.insert(id.into(), reason.into());
    }

    pub fn clear_rejection(&self, id: &RecordId) {
        self.state.lock().rejections.remove(id);
    }

    /// Delay every call, for exercising overlapping cycles
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn probe(&self) -> RemoteResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.calls.probe += 1;
        if state.offline {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        Ok(())
    }

    async fn pull(
        &self,
        entity_type: EntityType,
        cursor: &SyncCursor,
        limit: usize,
    ) -> RemoteResult<Vec<RemoteRow>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.calls.pull += 1;
        state.check_faults()?;

        let mut rows: Vec<RemoteRow> = state
            .tables
            .get(&entity_type)
            .map(|table| {
                table
                    .values()
                    .filter(|row| cursor.is_before(row.updated_at, &row.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn push(
        &self,
        entity_type: EntityType,
        batch: &[PushItem],
    ) -> RemoteResult<Vec<PushOutcome>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.calls.push += 1;
        state.check_faults()?;

        Ok(batch
            .iter()
            .map(|item| state.write(entity_type, item))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Payload;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn item(id: &str, local_version: i64, updated_at: i64) -> PushItem {
        PushItem {
            id: RecordId::from(id),
            local_version,
            updated_at,
            deleted_at: None,
            payload: payload(json!({ "name": id })),
        }
    }

    fn row(id: &str, updated_at: i64) -> RemoteRow {
        RemoteRow {
            id: RecordId::from(id),
            updated_at,
            deleted_at: None,
            version: None,
            payload: payload(json!({})),
        }
    }

    #[tokio::test]
    async fn push_is_idempotent_per_local_version() {
        let remote = MemoryRemote::new();

        let first = remote.push(EntityType::Habits, &[item("H1", 1, 10)]).await.unwrap();
        let retry = remote.push(EntityType::Habits, &[item("H1", 1, 10)]).await.unwrap();
        assert_eq!(first, retry);

        let next = remote.push(EntityType::Habits, &[item("H1", 2, 10)]).await.unwrap();
        assert_ne!(first, next);
        assert_eq!(remote.rows(EntityType::Habits).len(), 1);
    }

    #[tokio::test]
    async fn server_timestamps_increase() {
        let remote = MemoryRemote::new();
        let a = remote.seed(EntityType::Goals, row("G1", 0));
        let b = remote.seed(EntityType::Goals, row("G2", 0));
        assert!(b.updated_at > a.updated_at);

        let far_future = now_ms() + 1_000_000;
        let c = remote.seed(EntityType::Goals, row("G3", far_future));
        assert_eq!(c.updated_at, far_future);
    }

    #[tokio::test]
    async fn pull_pages_follow_cursor() {
        let remote = MemoryRemote::new();
        for id in ["A", "B", "C"] {
            remote.seed(EntityType::Tasks, row(id, 0));
        }

        let first = remote
            .pull(EntityType::Tasks, &SyncCursor::default(), 2)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let last = &first[1];
        let cursor = SyncCursor::new(last.updated_at, Some(last.id.clone()));
        let second = remote.pull(EntityType::Tasks, &cursor, 2).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id.as_str(), "C");
    }

    #[tokio::test]
    async fn injected_faults() {
        let remote = MemoryRemote::new();
        remote.reject("H1", "invalid");
        let outcomes = remote.push(EntityType::Habits, &[item("H1", 1, 1)]).await.unwrap();
        assert!(matches!(outcomes[0], PushOutcome::Rejected { .. }));

        remote.set_server_error(Some((503, "maintenance".to_string())));
        assert!(remote.probe().await.is_ok());
        assert_eq!(
            remote
                .pull(EntityType::Habits, &SyncCursor::default(), 10)
                .await
                .unwrap_err(),
            RemoteError::Server {
                status: 503,
                message: "maintenance".to_string()
            }
        );

        remote.set_offline(true);
        assert!(remote.probe().await.unwrap_err().is_network());
        assert_eq!(
            remote.calls(),
            CallCounts {
                probe: 2,
                pull: 1,
                push: 1
            }
        );
    }
}
