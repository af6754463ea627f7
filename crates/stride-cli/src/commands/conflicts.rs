use stride_core::models::{ConflictRecord, ResolutionChoice};

use crate::commands::common::{
    conflict_log_to_item, format_conflict_log_lines, format_open_conflict_lines,
    open_ready_engine, parse_entity, parse_record_id, Paths,
};
use crate::error::CliError;

pub async fn run_conflicts(
    entity: Option<&str>,
    history: bool,
    limit: usize,
    as_json: bool,
    paths: &Paths,
) -> Result<(), CliError> {
    let entity_type = entity.map(parse_entity).transpose()?;
    let engine = open_ready_engine(paths).await?;

    if history {
        let mut entries = engine.conflict_log(limit).await?;
        if let Some(entity_type) = entity_type {
            entries.retain(|entry| entry.entity_type == entity_type);
        }

        if as_json {
            let items = entries.iter().map(conflict_log_to_item).collect::<Vec<_>>();
            println!("{}", serde_json::to_string_pretty(&items)?);
        } else if entries.is_empty() {
            println!("No resolved conflicts recorded.");
        } else {
            for line in format_conflict_log_lines(&entries) {
                println!("{line}");
            }
        }
        return Ok(());
    }

    let conflicts: Vec<ConflictRecord> = engine.list_conflicts(entity_type).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
    } else if conflicts.is_empty() {
        println!("No open conflicts.");
    } else {
        for line in format_open_conflict_lines(&conflicts) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn parse_choice(choice: &str) -> Result<ResolutionChoice, CliError> {
    choice.parse::<ResolutionChoice>().map_err(CliError::InvalidChoice)
}

pub async fn run_resolve(
    entity: &str,
    id: &str,
    choice: &str,
    paths: &Paths,
) -> Result<(), CliError> {
    let entity_type = parse_entity(entity)?;
    let id = parse_record_id(id)?;
    let choice = parse_choice(choice)?;

    let engine = open_ready_engine(paths).await?;
    let record = engine.resolve_conflict(entity_type, &id, choice).await?;

    match choice {
        ResolutionChoice::Local => println!(
            "{entity_type}/{} keeps the local version; run `stride sync` to push it",
            record.id
        ),
        ResolutionChoice::Remote => {
            println!("{entity_type}/{} now matches the remote", record.id);
        }
    }
    Ok(())
}
