use stride_core::util::now_ms;

use crate::commands::common::{open_ready_engine, Paths};
use crate::error::CliError;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub async fn run_purge(older_than_days: u32, paths: &Paths) -> Result<(), CliError> {
    let engine = open_ready_engine(paths).await?;
    let cutoff = purge_cutoff(now_ms(), older_than_days);
    let purged = engine.purge_tombstones(cutoff).await?;

    println!("Purged {purged} deleted record(s)");
    Ok(())
}

pub fn purge_cutoff(now_ms: i64, older_than_days: u32) -> i64 {
    now_ms.saturating_sub(i64::from(older_than_days) * DAY_MS)
}
