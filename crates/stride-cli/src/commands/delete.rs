use crate::commands::common::{open_ready_engine, parse_entity, parse_record_id, Paths};
use crate::error::CliError;

pub async fn run_delete(entity: &str, id: &str, paths: &Paths) -> Result<(), CliError> {
    let entity_type = parse_entity(entity)?;
    let id = parse_record_id(id)?;

    let engine = open_ready_engine(paths).await?;
    let record = engine.delete_local(entity_type, &id).await?;

    println!("{}", record.id);
    Ok(())
}
