//! Per-collection pull watermark

use serde::{Deserialize, Serialize};

use super::record::RecordId;

/// Highest remote position successfully pulled for one collection.
///
/// Rows are ordered by `(updated_at, id)`; the next pull asks for rows strictly
/// after this pair, so equal timestamps split across pages are neither skipped
/// nor fetched twice.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub updated_at: i64,
    pub last_id: Option<RecordId>,
}

impl SyncCursor {
    pub const fn new(updated_at: i64, last_id: Option<RecordId>) -> Self {
        Self {
            updated_at,
            last_id,
        }
    }

    /// Whether a row at `(updated_at, id)` lies after this cursor
    pub fn is_before(&self, updated_at: i64, id: &RecordId) -> bool {
        match updated_at.cmp(&self.updated_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.last_id.as_ref().is_none_or(|last| id > last),
        }
    }

    /// Move forward to `(updated_at, id)` if that position is later
    pub fn advance(&mut self, updated_at: i64, id: &RecordId) {
        if self.is_before(updated_at, id) {
            self.updated_at = updated_at;
            self.last_id = Some(id.clone());
        }
    }
}
