use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use stride_core::state::{SyncEventKind, SyncPhase, SyncStatusEvent};
use stride_core::sync::EntityCycleState;
use stride_core::{EntityStatus, SyncMetadata, SyncReport};

use crate::commands::common::{format_sync_timestamp, open_ready_engine, open_sync_engine, Paths};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct EntityReportItem {
    pub state: String,
    pub pulled: usize,
    pub pushed: usize,
    pub skipped: usize,
    pub kept_local: usize,
    pub conflicts: usize,
    pub auto_resolved: usize,
    pub rejected: usize,
    pub deferred: usize,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncReportItem {
    pub online: bool,
    pub cancelled: bool,
    pub pulled: usize,
    pub pushed: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub entities: BTreeMap<String, EntityReportItem>,
}

pub fn sync_report_to_item(report: &SyncReport) -> SyncReportItem {
    SyncReportItem {
        online: report.online,
        cancelled: report.cancelled,
        pulled: report.pulled(),
        pushed: report.pushed(),
        conflicts: report.conflicts(),
        errors: report.errors(),
        entities: report
            .entities
            .iter()
            .map(|(entity_type, entity)| {
                let item = EntityReportItem {
                    state: cycle_state_label(entity.state).to_string(),
                    pulled: entity.inserted + entity.overwritten,
                    pushed: entity.pushed,
                    skipped: entity.skipped,
                    kept_local: entity.kept_local,
                    conflicts: entity.conflicts,
                    auto_resolved: entity.auto_resolved,
                    rejected: entity.rejected,
                    deferred: entity.deferred,
                    error: entity.error.clone(),
                };
                (entity_type.to_string(), item)
            })
            .collect(),
    }
}

const fn cycle_state_label(state: EntityCycleState) -> &'static str {
    match state {
        EntityCycleState::Idle => "idle",
        EntityCycleState::Pulling => "pulling",
        EntityCycleState::Pushing => "pushing",
        EntityCycleState::Done => "done",
        EntityCycleState::Error => "error",
    }
}

pub fn format_sync_report_lines(report: &SyncReport) -> Vec<String> {
    if !report.online {
        return vec!["Remote unreachable; nothing was synced.".to_string()];
    }

    let mut lines = report
        .entities
        .iter()
        .map(|(entity_type, entity)| {
            let mut line = format!(
                "{:<20}  {:<7}  pulled={} pushed={} conflicts={}",
                entity_type.as_str(),
                cycle_state_label(entity.state),
                entity.inserted + entity.overwritten + entity.auto_resolved,
                entity.pushed,
                entity.conflicts
            );
            if entity.rejected > 0 {
                line.push_str(&format!(" rejected={}", entity.rejected));
            }
            if let Some(error) = &entity.error {
                line.push_str(&format!("  {error}"));
            }
            line
        })
        .collect::<Vec<_>>();

    let summary = if report.cancelled {
        "Sync stopped before every collection was visited".to_string()
    } else if report.is_clean() {
        "Sync completed".to_string()
    } else {
        format!(
            "Sync finished with {} conflict(s) and {} error(s)",
            report.conflicts(),
            report.errors()
        )
    };
    lines.push(summary);
    lines
}

pub async fn run_sync(as_json: bool, paths: &Paths) -> Result<(), CliError> {
    let engine = open_sync_engine(paths)?;
    let report = engine.sync_all().await?;

    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&sync_report_to_item(&report))?
        );
    } else {
        for line in format_sync_report_lines(&report) {
            println!("{line}");
        }
    }
    Ok(())
}

const fn entity_status_label(status: EntityStatus) -> &'static str {
    match status {
        EntityStatus::Synced => "synced",
        EntityStatus::Syncing => "syncing",
        EntityStatus::Error => "error",
        EntityStatus::Conflict => "conflict",
        EntityStatus::Pending => "pending",
    }
}

pub fn format_metadata_lines(metadata: &SyncMetadata) -> Vec<String> {
    let last_sync = metadata
        .last_sync_at
        .map_or_else(|| "never".to_string(), format_sync_timestamp);

    let mut lines = vec![
        format!("Status:          {}", entity_status_label(metadata.aggregate_status())),
        format!("Pending changes: {}", metadata.pending_changes),
        format!("Last sync:       {last_sync}"),
    ];
    lines.extend(metadata.entity_status.iter().map(|(entity_type, status)| {
        format!("  {:<20}  {}", entity_type.as_str(), entity_status_label(*status))
    }));
    lines
}

pub async fn run_status(as_json: bool, paths: &Paths) -> Result<(), CliError> {
    let engine = open_ready_engine(paths).await?;
    let metadata = engine.get_sync_metadata();

    if as_json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
    } else {
        for line in format_metadata_lines(&metadata) {
            println!("{line}");
        }
    }
    Ok(())
}

/// One progress line per status event; idle events print nothing
pub fn format_status_event(event: &SyncStatusEvent) -> Option<String> {
    match event.kind {
        SyncEventKind::Idle => None,
        SyncEventKind::Syncing => {
            let progress = event.progress.unwrap_or(0);
            let target = match (event.entity_type, event.phase) {
                (Some(entity_type), Some(phase)) => {
                    format!(" {} {}", entity_type.as_str(), phase_label(phase))
                }
                (Some(entity_type), None) => format!(" {}", entity_type.as_str()),
                _ => String::new(),
            };
            Some(format!("[{progress:>3}%]{target}"))
        }
        SyncEventKind::Success => Some(format!(
            "Synced: {}",
            event.message.as_deref().unwrap_or("done")
        )),
        SyncEventKind::Error => Some(format!(
            "Sync failed: {}",
            event.message.as_deref().unwrap_or("unknown error")
        )),
    }
}

const fn phase_label(phase: SyncPhase) -> &'static str {
    match phase {
        SyncPhase::Pulling => "pulling",
        SyncPhase::Pushing => "pushing",
    }
}

pub async fn run_watch(interval_secs: Option<u64>, paths: &Paths) -> Result<(), CliError> {
    let engine = open_sync_engine(paths)?;
    let interval = interval_secs.map_or_else(
        || engine.config().poll_interval(),
        |secs| Duration::from_secs(secs.max(1)),
    );

    let subscription = engine.on_sync_status_change(|event| {
        if let Some(line) = format_status_event(event) {
            println!("{line}");
        }
    });

    println!(
        "Syncing every {}s; press Ctrl-C to stop",
        interval.as_secs()
    );
    let mut handle = engine.spawn_periodic_sync(interval);

    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            true
        }
        result = &mut handle => {
            if let Err(error) = result {
                tracing::warn!("Periodic sync task ended abnormally: {error}");
            }
            false
        }
    };

    if interrupted {
        engine.stop();
        if let Err(error) = handle.await {
            tracing::warn!("Periodic sync task ended abnormally: {error}");
        }
    }

    subscription.unsubscribe();
    Ok(())
}
