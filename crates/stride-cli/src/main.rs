//! Stride CLI - operator front-end for the offline sync engine
//!
//! Edits records in the local store and drives sync cycles against the
//! configured remote.

mod cli;
mod commands;
mod error;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::add::run_add;
use crate::commands::common::Paths;
use crate::commands::conflicts::{run_conflicts, run_resolve};
use crate::commands::delete::run_delete;
use crate::commands::edit::run_edit;
use crate::commands::list::run_list;
use crate::commands::migrate::run_migrate;
use crate::commands::purge::run_purge;
use crate::commands::sync::{run_status, run_sync, run_watch};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "stride=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = Paths::resolve(cli.config, cli.db_path);

    match cli.command {
        Commands::Migrate { retry, list } => run_migrate(retry, list, &paths).await,
        Commands::Sync { json } => run_sync(json, &paths).await,
        Commands::Status { json } => run_status(json, &paths).await,
        Commands::Watch { interval } => run_watch(interval, &paths).await,
        Commands::Conflicts {
            entity,
            history,
            limit,
            json,
        } => run_conflicts(entity.as_deref(), history, limit, json, &paths).await,
        Commands::Resolve { entity, id, choice } => {
            run_resolve(&entity, &id, &choice, &paths).await
        }
        Commands::Add {
            entity,
            payload,
            id,
        } => run_add(&entity, payload.as_deref(), id.as_deref(), &paths).await,
        Commands::Edit {
            entity,
            id,
            payload,
        } => run_edit(&entity, &id, payload.as_deref(), &paths).await,
        Commands::Delete { entity, id } => run_delete(&entity, &id, &paths).await,
        Commands::List { entity, all, json } => run_list(&entity, all, json, &paths).await,
        Commands::Purge { older_than_days } => run_purge(older_than_days, &paths).await,
    }
}
