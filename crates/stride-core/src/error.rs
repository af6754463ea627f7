//! Error types for stride-core

use thiserror::Error;

use crate::models::EntityType;

/// Result type alias using stride-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in stride-core operations
///
/// The error is `Clone` so one coalesced sync cycle can hand the same outcome
/// to every caller awaiting it. Source errors are captured as messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Local database error
    #[error("Database error: {0}")]
    Database(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A migration failed or was interrupted; sync stays blocked until it is cleared
    #[error("Migration {id} ({name}) failed: {message}")]
    FatalMigration {
        id: u32,
        name: String,
        message: String,
    },

    /// Declared migrations are not strictly ascending
    #[error("Migrations must be declared in strictly ascending order: {0}")]
    MigrationOrder(String),

    /// Remote was unreachable or timed out
    #[error("Network error: {0}")]
    Network(String),

    /// Remote refused the whole request
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// Remote rejected a single record
    #[error("Remote rejected record {id}: {reason}")]
    RemoteRejected { id: String, reason: String },

    /// No open conflict exists for the record
    #[error("No open conflict for {entity_type}/{id}")]
    ConflictNotFound { entity_type: EntityType, id: String },

    /// Sync was stopped
    #[error("Sync cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the error leaves the engine usable (callers may just report it)
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::FatalMigration { .. } | Self::MigrationOrder(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        Self::Database(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_not_found_is_recoverable() {
        let error = Error::ConflictNotFound {
            entity_type: EntityType::Goals,
            id: "G1".to_string(),
        };
        assert!(error.is_recoverable());
        assert_eq!(error.to_string(), "No open conflict for goals/G1");
    }

    #[test]
    fn migration_failure_is_fatal() {
        let error = Error::FatalMigration {
            id: 2,
            name: "cursors".to_string(),
            message: "no such table".to_string(),
        };
        assert!(!error.is_recoverable());
        assert!(error.to_string().contains("Migration 2 (cursors)"));
    }
}
