use stride_core::LocalStore;

use crate::commands::common::{
    format_record_lines, open_ready_engine, parse_entity, record_to_list_item, Paths,
    RecordListItem,
};
use crate::error::CliError;

pub async fn run_list(
    entity: &str,
    include_deleted: bool,
    as_json: bool,
    paths: &Paths,
) -> Result<(), CliError> {
    let entity_type = parse_entity(entity)?;
    let engine = open_ready_engine(paths).await?;

    let records = engine
        .store()
        .get_all(entity_type)
        .await?
        .into_iter()
        .filter(|record| include_deleted || !record.is_tombstone())
        .collect::<Vec<_>>();

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No {entity_type} yet.");
        return Ok(());
    }

    for line in format_record_lines(&records) {
        println!("{line}");
    }
    Ok(())
}
