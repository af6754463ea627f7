//! Database layer for Stride

mod connection;
mod migrations;
mod store;

pub use connection::Database;
pub use migrations::{
    Migration, MigrationRecord, MigrationReport, MigrationRunner, MigrationStatus, MIGRATIONS,
};
pub use store::{LocalStore, PushAck, ResolutionWrite, SqliteLocalStore};
