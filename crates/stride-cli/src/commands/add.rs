use crate::commands::common::{
    open_ready_engine, parse_entity, parse_record_id, resolve_payload, Paths,
};
use crate::error::CliError;

pub async fn run_add(
    entity: &str,
    payload: Option<&str>,
    id: Option<&str>,
    paths: &Paths,
) -> Result<(), CliError> {
    let entity_type = parse_entity(entity)?;
    let payload = resolve_payload(payload)?;
    let id = id.map(parse_record_id).transpose()?;

    let engine = open_ready_engine(paths).await?;
    let record = engine.save_local(entity_type, id, payload).await?;

    println!("{}", record.id);
    Ok(())
}
