use stride_core::LocalStore;

use crate::commands::common::{
    capture_editor_input_with_initial, open_ready_engine, parse_entity, parse_payload,
    parse_record_id, Paths,
};
use crate::error::CliError;

pub async fn run_edit(
    entity: &str,
    id: &str,
    payload: Option<&str>,
    paths: &Paths,
) -> Result<(), CliError> {
    let entity_type = parse_entity(entity)?;
    let id = parse_record_id(id)?;

    let engine = open_ready_engine(paths).await?;
    let existing = engine
        .store()
        .get(entity_type, &id)
        .await?
        .filter(|record| !record.is_tombstone())
        .ok_or_else(|| CliError::RecordNotFound(format!("{entity_type}/{id}")))?;

    let payload = match payload {
        Some(raw) => parse_payload(raw)?,
        None => {
            let initial = serde_json::to_string_pretty(&existing.payload)?;
            parse_payload(&capture_editor_input_with_initial(&initial)?)?
        }
    };

    if payload == existing.payload {
        println!("No changes");
        return Ok(());
    }

    let record = engine.save_local(entity_type, Some(id), payload).await?;
    println!("{}", record.id);
    Ok(())
}
