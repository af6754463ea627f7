//! Database migrations
//!
//! Migrations are forward-only and declared in strictly ascending id order.
//! Each one moves through `Pending -> Running -> Applied | Failed`, and that
//! state is persisted per id. A failed or interrupted migration blocks every
//! later migration and every sync cycle until an operator clears it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::store::LocalStore;
use crate::error::{Error, Result};

/// One declared schema or metadata migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub id: u32,
    pub name: &'static str,
    /// Statements run inside a single transaction
    pub statements: &'static [&'static str],
}

/// Persisted migration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Running,
    Applied,
    Failed,
}

impl MigrationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown migration status '{other}'")),
        }
    }
}

/// Ledger row for one migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: u32,
    pub name: String,
    pub status: MigrationStatus,
    /// Last status change (Unix ms)
    pub updated_at: i64,
    pub error: Option<String>,
}

/// Outcome of a successful `check_and_run`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Ids applied during this call
    pub applied: Vec<u32>,
    /// Ids that were already applied
    pub skipped: Vec<u32>,
}

/// Migrations shipped with this version of the local store
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "records",
        statements: &[
            "CREATE TABLE IF NOT EXISTS records (
                entity_type TEXT NOT NULL,
                id TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER,
                local_version INTEGER NOT NULL DEFAULT 0,
                remote_version TEXT,
                last_remote_updated_at INTEGER,
                dirty INTEGER NOT NULL DEFAULT 0,
                sync_state TEXT NOT NULL DEFAULT 'synced',
                PRIMARY KEY (entity_type, id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_records_dirty ON records(entity_type, dirty)",
            "CREATE INDEX IF NOT EXISTS idx_records_sync_state ON records(sync_state)",
        ],
    },
    Migration {
        id: 2,
        name: "sync_cursors",
        statements: &["CREATE TABLE IF NOT EXISTS sync_cursors (
            entity_type TEXT PRIMARY KEY,
            updated_at INTEGER NOT NULL,
            last_id TEXT
        )"],
    },
    Migration {
        id: 3,
        name: "sync_conflicts",
        statements: &[
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                entity_type TEXT NOT NULL,
                id TEXT NOT NULL,
                local_snapshot TEXT NOT NULL,
                remote_snapshot TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                PRIMARY KEY (entity_type, id)
            )",
            "CREATE TABLE IF NOT EXISTS conflict_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                record_id TEXT NOT NULL,
                local_updated_at INTEGER NOT NULL,
                incoming_updated_at INTEGER NOT NULL,
                resolved_at INTEGER NOT NULL,
                strategy TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_conflict_log_resolved_at ON conflict_log(resolved_at DESC)",
        ],
    },
    Migration {
        id: 4,
        name: "push_retry",
        statements: &[
            "ALTER TABLE records ADD COLUMN push_attempts INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE records ADD COLUMN next_attempt_at INTEGER",
            "ALTER TABLE records ADD COLUMN last_error TEXT",
        ],
    },
    Migration {
        id: 5,
        name: "sync_meta",
        statements: &["CREATE TABLE IF NOT EXISTS sync_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )"],
    },
    Migration {
        id: 6,
        name: "tombstones_and_remote_watermark",
        statements: &[
            "CREATE INDEX IF NOT EXISTS idx_records_deleted ON records(deleted_at)",
            "UPDATE records SET last_remote_updated_at = updated_at
             WHERE last_remote_updated_at IS NULL AND dirty = 0",
        ],
    },
];

/// Check that ids are strictly ascending
pub fn validate_order(migrations: &[Migration]) -> Result<()> {
    for pair in migrations.windows(2) {
        if pair[1].id <= pair[0].id {
            return Err(Error::MigrationOrder(format!(
                "migration {} ({}) follows {} ({})",
                pair[1].id, pair[1].name, pair[0].id, pair[0].name
            )));
        }
    }
    Ok(())
}

/// Applies declared migrations through a [`LocalStore`]
///
/// Clones share one run lock, so at most one `check_and_run` or
/// `clear_failure` touches the ledger at a time.
#[derive(Clone)]
pub struct MigrationRunner {
    store: Arc<dyn LocalStore>,
    migrations: Vec<Migration>,
    run_lock: Arc<Mutex<()>>,
}

impl MigrationRunner {
    /// Runner for the migrations shipped with this crate
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self::with_migrations(store, MIGRATIONS.to_vec())
    }

    /// Runner for a custom migration list
    pub fn with_migrations(store: Arc<dyn LocalStore>, migrations: Vec<Migration>) -> Self {
        Self {
            store,
            migrations,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Declared migrations
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Apply every unapplied migration in order.
    ///
    /// Stops at the first failure and returns [`Error::FatalMigration`];
    /// earlier migrations stay applied. A `Running` row seen while holding
    /// the run lock was left behind by a process that died mid-run.
    pub async fn check_and_run(&self) -> Result<MigrationReport> {
        validate_order(&self.migrations)?;
        let _running = self.run_lock.lock().await;

        let ledger: BTreeMap<u32, MigrationRecord> = self
            .store
            .migration_ledger()
            .await?
            .into_iter()
            .map(|record| (record.id, record))
            .collect();

        let mut report = MigrationReport::default();
        let mut highest_applied = ledger
            .values()
            .filter(|record| record.status == MigrationStatus::Applied)
            .map(|record| record.id)
            .max();

        for migration in &self.migrations {
            match ledger.get(&migration.id).map(|record| record.status) {
                Some(MigrationStatus::Applied) => {
                    report.skipped.push(migration.id);
                    continue;
                }
                Some(MigrationStatus::Failed) => {
                    let message = ledger
                        .get(&migration.id)
                        .and_then(|record| record.error.clone())
                        .unwrap_or_else(|| "previous attempt failed".to_string());
                    return Err(fatal(migration, message));
                }
                Some(MigrationStatus::Running) => {
                    let message = "interrupted while running".to_string();
                    self.store
                        .set_migration_status(migration, MigrationStatus::Failed, Some(&message))
                        .await?;
                    return Err(fatal(migration, message));
                }
                Some(MigrationStatus::Pending) | None => {}
            }

            if let Some(highest) = highest_applied.filter(|highest| *highest > migration.id) {
                return Err(Error::MigrationOrder(format!(
                    "migration {} ({}) is pending but {highest} is already applied",
                    migration.id, migration.name
                )));
            }

            self.store
                .set_migration_status(migration, MigrationStatus::Running, None)
                .await?;

            if let Err(error) = self.store.apply_migration(migration).await {
                let message = error.to_string();
                tracing::error!(
                    "Migration {} ({}) failed: {message}",
                    migration.id,
                    migration.name
                );
                self.store
                    .set_migration_status(migration, MigrationStatus::Failed, Some(&message))
                    .await?;
                return Err(fatal(migration, message));
            }

            tracing::info!("Applied migration {} ({})", migration.id, migration.name);
            highest_applied = Some(migration.id);
            report.applied.push(migration.id);
        }

        Ok(report)
    }

    /// Declared migrations merged with their persisted state
    pub async fn status(&self) -> Result<Vec<MigrationRecord>> {
        let ledger: BTreeMap<u32, MigrationRecord> = self
            .store
            .migration_ledger()
            .await?
            .into_iter()
            .map(|record| (record.id, record))
            .collect();

        Ok(self
            .migrations
            .iter()
            .map(|migration| {
                ledger.get(&migration.id).cloned().unwrap_or(MigrationRecord {
                    id: migration.id,
                    name: migration.name.to_string(),
                    status: MigrationStatus::Pending,
                    updated_at: 0,
                    error: None,
                })
            })
            .collect())
    }

    /// Whether any declared migration is failed or interrupted
    pub async fn is_blocked(&self) -> Result<bool> {
        Ok(self.status().await?.iter().any(|record| {
            matches!(
                record.status,
                MigrationStatus::Failed | MigrationStatus::Running
            )
        }))
    }

    /// Reset a failed migration to pending so the next run retries it
    pub async fn clear_failure(&self, id: u32) -> Result<()> {
        let migration = self
            .migrations
            .iter()
            .find(|migration| migration.id == id)
            .ok_or_else(|| Error::NotFound(format!("migration {id}")))?;
        let _running = self.run_lock.lock().await;

        let current = self
            .status()
            .await?
            .into_iter()
            .find(|record| record.id == id)
            .map(|record| record.status);

        match current {
            Some(MigrationStatus::Failed | MigrationStatus::Running) => {
                self.store
                    .set_migration_status(migration, MigrationStatus::Pending, None)
                    .await?;
                tracing::info!("Cleared failure of migration {id} ({})", migration.name);
                Ok(())
            }
            _ => Err(Error::InvalidInput(format!(
                "migration {id} is not in a failed state"
            ))),
        }
    }
}

fn fatal(migration: &Migration, message: String) -> Error {
    Error::FatalMigration {
        id: migration.id,
        name: migration.name.to_string(),
        message,
    }
}
