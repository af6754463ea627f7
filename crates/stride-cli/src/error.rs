use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] stride_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Unknown collection '{0}'")]
    UnknownEntity(String),
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("No payload provided")]
    EmptyPayload,
    #[error("Payload must be a JSON object")]
    PayloadNotObject,
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error("{0}")]
    InvalidChoice(String),
    #[error("Editor command failed: {0}")]
    EditorFailed(String),
    #[error(
        "Sync is not configured. Set remote_url in the config file or STRIDE_REMOTE_URL to enable `stride sync`."
    )]
    SyncNotConfigured,
}
