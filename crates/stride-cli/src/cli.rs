use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "stride")]
#[command(about = "Track goals, habits, routines and tasks offline and sync them later")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the sync config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply pending schema migrations
    Migrate {
        /// Reset a failed migration before running
        #[arg(long, value_name = "ID")]
        retry: Option<u32>,
        /// Show the migration ledger instead of running
        #[arg(long)]
        list: bool,
    },
    /// Run one sync cycle against the configured remote
    Sync {
        /// Output the cycle report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show pending changes and per-collection status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sync periodically until interrupted
    Watch {
        /// Seconds between cycles (defaults to the configured poll interval)
        #[arg(short, long, value_name = "SECS")]
        interval: Option<u64>,
    },
    /// List open conflicts
    Conflicts {
        /// Only this collection
        #[arg(long, value_name = "ENTITY")]
        entity: Option<String>,
        /// Show resolved conflicts instead
        #[arg(long)]
        history: bool,
        /// Number of history entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle an open conflict
    Resolve {
        /// Collection name (e.g. goals, habit_completions)
        entity: String,
        /// Record ID
        id: String,
        /// Side to keep: local or remote
        choice: String,
    },
    /// Create a record from a JSON object
    #[command(alias = "new")]
    Add {
        /// Collection name
        entity: String,
        /// JSON payload (read from stdin when omitted)
        payload: Option<String>,
        /// Explicit record ID
        #[arg(long, value_name = "ID")]
        id: Option<String>,
    },
    /// Replace a record's fields
    Edit {
        /// Collection name
        entity: String,
        /// Record ID
        id: String,
        /// JSON payload (opens $EDITOR when omitted)
        payload: Option<String>,
    },
    /// Delete a record
    Delete {
        /// Collection name
        entity: String,
        /// Record ID
        id: String,
    },
    /// List records of a collection
    List {
        /// Collection name
        entity: String,
        /// Include deleted records
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove acknowledged deletions older than the given age
    Purge {
        /// Minimum tombstone age in days
        #[arg(long, default_value = "30", value_name = "DAYS")]
        older_than_days: u32,
    },
}
