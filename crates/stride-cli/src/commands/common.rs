use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use stride_core::models::{ConflictLogEntry, ConflictRecord, SyncCursor};
use stride_core::remote::{PushItem, PushOutcome, RemoteError, RemoteResult, RemoteRow};
use stride_core::{
    EntityType, HttpRemoteClient, Payload, RecordId, RemoteClient, SqliteLocalStore, SyncConfig,
    SyncEngine, SyncableRecord,
};

use crate::error::CliError;

/// Files the CLI operates on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config: PathBuf,
    pub db: PathBuf,
}

impl Paths {
    pub fn resolve(cli_config: Option<PathBuf>, cli_db_path: Option<PathBuf>) -> Self {
        Self {
            config: resolve_config_path(cli_config),
            db: resolve_db_path(cli_db_path),
        }
    }
}

pub fn resolve_config_path(cli_config: Option<PathBuf>) -> PathBuf {
    cli_config
        .or_else(|| env::var_os("STRIDE_CONFIG").map(PathBuf::from))
        .unwrap_or_else(default_config_path)
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stride")
        .join("config.json")
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("STRIDE_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stride")
        .join("stride.db")
}

pub fn load_config(config_path: &Path) -> Result<SyncConfig, CliError> {
    Ok(SyncConfig::load(config_path)?.with_env_overrides()?)
}

/// Stand-in remote for local-only commands when no remote is configured
struct UnconfiguredRemote;

#[async_trait]
impl RemoteClient for UnconfiguredRemote {
    async fn probe(&self) -> RemoteResult<()> {
        Err(not_configured())
    }

    async fn pull(
        &self,
        _entity_type: EntityType,
        _cursor: &SyncCursor,
        _limit: usize,
    ) -> RemoteResult<Vec<RemoteRow>> {
        Err(not_configured())
    }

    async fn push(
        &self,
        _entity_type: EntityType,
        _batch: &[PushItem],
    ) -> RemoteResult<Vec<PushOutcome>> {
        Err(not_configured())
    }
}

fn not_configured() -> RemoteError {
    RemoteError::Network("no remote configured".to_string())
}

#[derive(Clone, Copy)]
enum OpenEngineMode {
    Local,
    RequireRemote,
}

impl OpenEngineMode {
    const fn requires_remote(self) -> bool {
        matches!(self, Self::RequireRemote)
    }
}

fn open_engine_with_mode(paths: &Paths, mode: OpenEngineMode) -> Result<SyncEngine, CliError> {
    let config = load_config(&paths.config)?;
    let remote: Arc<dyn RemoteClient> = match HttpRemoteClient::from_config(&config)? {
        Some(client) => {
            tracing::debug!("Using remote {}", client.base_url());
            Arc::new(client)
        }
        None if mode.requires_remote() => return Err(CliError::SyncNotConfigured),
        None => Arc::new(UnconfiguredRemote),
    };

    let store = SqliteLocalStore::open(&paths.db)?;
    Ok(SyncEngine::new(Arc::new(store), remote, config))
}

/// Engine without touching the schema; `sync_all` migrates on its own
pub fn open_engine(paths: &Paths) -> Result<SyncEngine, CliError> {
    open_engine_with_mode(paths, OpenEngineMode::Local)
}

/// Engine for sync commands; fails when no remote is configured
pub fn open_sync_engine(paths: &Paths) -> Result<SyncEngine, CliError> {
    open_engine_with_mode(paths, OpenEngineMode::RequireRemote)
}

/// Engine whose schema is up to date, with metadata loaded
pub async fn open_ready_engine(paths: &Paths) -> Result<SyncEngine, CliError> {
    let engine = open_engine(paths)?;
    engine.check_and_run_migrations().await?;
    engine.refresh_metadata().await?;
    Ok(engine)
}

pub fn parse_entity(entity: &str) -> Result<EntityType, CliError> {
    entity
        .parse::<EntityType>()
        .map_err(|_| CliError::UnknownEntity(entity.trim().to_string()))
}

pub fn parse_record_id(id: &str) -> Result<RecordId, CliError> {
    id.parse::<RecordId>().map_err(|_| CliError::EmptyRecordId)
}

pub fn parse_payload(raw: &str) -> Result<Payload, CliError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyPayload);
    }
    match serde_json::from_str::<serde_json::Value>(trimmed)? {
        serde_json::Value::Object(payload) => Ok(payload),
        _ => Err(CliError::PayloadNotObject),
    }
}

/// Payload from the argument, else from piped stdin
pub fn resolve_payload(raw: Option<&str>) -> Result<Payload, CliError> {
    if let Some(raw) = raw {
        return parse_payload(raw);
    }
    match read_piped_stdin()? {
        Some(input) => parse_payload(&input),
        None => Err(CliError::EmptyPayload),
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    let trimmed = buffer.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

pub fn capture_editor_input_with_initial(initial_content: &str) -> Result<String, CliError> {
    let editor = preferred_editor();
    let temp_file = create_temp_record_file_path();
    std::fs::write(&temp_file, initial_content)?;

    let launch_result = launch_editor(&editor, &temp_file);
    let content = std::fs::read_to_string(&temp_file)?;
    let _ = std::fs::remove_file(&temp_file);

    launch_result?;
    Ok(content)
}

pub fn launch_editor(editor: &str, file_path: &Path) -> Result<(), CliError> {
    match Command::new(editor).arg(file_path).status() {
        Ok(status) => {
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let mut parts = editor.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(CliError::EditorFailed("empty EDITOR command".into()));
            };

            let status = Command::new(program).args(parts).arg(file_path).status()?;
            if status.success() {
                Ok(())
            } else {
                Err(CliError::EditorFailed(format!(
                    "`{editor}` exited with status {status}"
                )))
            }
        }
        Err(err) => Err(CliError::Io(err)),
    }
}

pub fn preferred_editor() -> String {
    env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| default_editor().to_string())
}

pub const fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "vi"
    }
}

pub fn create_temp_record_file_path() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    env::temp_dir().join(format!("stride-record-{}-{now}.json", std::process::id()))
}

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub title: String,
    pub sync_state: String,
    pub updated_at: i64,
    pub relative_time: String,
    pub deleted: bool,
    pub payload: Payload,
}

pub fn record_to_list_item(record: &SyncableRecord) -> RecordListItem {
    let now_ms = Utc::now().timestamp_millis();
    RecordListItem {
        id: record.id.to_string(),
        title: record_title(&record.payload, 80),
        sync_state: record.sync_state.as_str().to_string(),
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
        deleted: record.is_tombstone(),
        payload: record.payload.clone(),
    }
}

pub fn format_record_lines(records: &[SyncableRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let id = record.id.to_string();
            let short_id = id.chars().take(13).collect::<String>();
            let title = record_title(&record.payload, 40);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            let state = if record.is_tombstone() {
                "deleted"
            } else {
                record.sync_state.as_str()
            };
            format!("{short_id:<13}  {title:<40}  {relative_time:<10}  {state}")
        })
        .collect()
}

/// Display label: the `title` or `name` field, else the compact JSON payload
pub fn record_title(payload: &Payload, max_chars: usize) -> String {
    let label = ["title", "name"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(serde_json::Value::as_str))
        .map_or_else(
            || serde_json::Value::Object(payload.clone()).to_string(),
            str::to_string,
        );
    let collapsed = label.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_open_conflict_lines(conflicts: &[ConflictRecord]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {}/{}  local={} remote={}  {}",
                format_sync_timestamp(conflict.detected_at),
                conflict.entity_type,
                conflict.id,
                conflict.local.updated_at,
                conflict.remote.updated_at,
                record_title(&conflict.remote.payload, 40)
            )
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct ConflictLogItem {
    pub id: i64,
    pub entity_type: String,
    pub record_id: String,
    pub local_updated_at: i64,
    pub incoming_updated_at: i64,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub strategy: String,
}

pub fn conflict_log_to_item(entry: &ConflictLogEntry) -> ConflictLogItem {
    ConflictLogItem {
        id: entry.id,
        entity_type: entry.entity_type.to_string(),
        record_id: entry.record_id.clone(),
        local_updated_at: entry.local_updated_at,
        incoming_updated_at: entry.incoming_updated_at,
        resolved_at: entry.resolved_at,
        resolved_at_iso: format_sync_timestamp(entry.resolved_at),
        strategy: entry.strategy.to_string(),
    }
}

pub fn format_conflict_log_lines(entries: &[ConflictLogEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            format!(
                "{}  {:<13}  {}/{}  local={} incoming={}",
                format_sync_timestamp(entry.resolved_at),
                entry.strategy.as_str(),
                entry.entity_type,
                entry.record_id,
                entry.local_updated_at,
                entry.incoming_updated_at
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}
