use stride_core::util::compact_text;

use crate::commands::common::{format_sync_timestamp, open_engine, Paths};
use crate::error::CliError;

pub async fn run_migrate(retry: Option<u32>, list: bool, paths: &Paths) -> Result<(), CliError> {
    let engine = open_engine(paths)?;

    if list {
        let ledger = engine.migration_status().await?;
        if ledger.is_empty() {
            println!("No migrations recorded.");
        }
        for record in ledger {
            let error = record.error.as_deref().map_or_else(String::new, |message| {
                format!("  {}", compact_text(message))
            });
            println!(
                "{:>3}  {:<8}  {:<32}  {}{error}",
                record.id,
                record.status.as_str(),
                record.name,
                format_sync_timestamp(record.updated_at)
            );
        }
        return Ok(());
    }

    if let Some(id) = retry {
        engine.clear_migration_failure(id).await?;
        println!("Migration {id} reset to pending");
    }

    let report = engine.check_and_run_migrations().await?;
    if report.applied.is_empty() {
        println!("Schema up to date ({} migrations)", report.skipped.len());
    } else {
        for id in &report.applied {
            println!("Applied migration {id}");
        }
    }
    Ok(())
}
