use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

use super::records::NormalizedRecord;
use super::store::archive_active_row;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub archived: usize,
    /// Keys with no active row left, e.g. when a failed run is replayed.
    pub already_archived: usize,
}

/// Soft-deletes the active row behind every updated record. Rows are never
/// removed and an archived row keeps its original timestamp.
pub fn archive_updated(
    connection: &Connection,
    updated: &[NormalizedRecord],
    archived_at: &str,
) -> Result<ArchiveStats> {
    let mut stats = ArchiveStats::default();

    for record in updated {
        if archive_active_row(connection, &record.natural_key(), archived_at)? {
            stats.archived += 1;
        } else {
            debug!(
                source_type = %record.source_type,
                source_id = %record.source_id,
                "no active row to archive"
            );
            stats.already_archived += 1;
        }
    }

    Ok(stats)
}
