use anyhow::Result;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::reconcile::{FileJobLedger, count_rows, open_store_read_only};
use crate::model::SourceInventoryManifest;
use crate::util::read_json_if_exists;

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.layout.manifest_dir();
    let inventory_path = manifest_dir.join("source_inventory.json");
    let db_path = args.layout.db_path();
    let ledger = FileJobLedger::in_manifest_dir(&manifest_dir);

    info!(data_root = %args.layout.data_root.display(), "status requested");

    if ledger.path().exists() {
        let state = ledger.state()?;
        let last_entry = state.stage_log.last();

        info!(
            run_id = %state.active_run_id.unwrap_or_default(),
            stage = %state.current_stage.unwrap_or_default(),
            status = %state.status.unwrap_or_default(),
            started_at = %state.started_at.unwrap_or_default(),
            updated_at = %state.updated_at.unwrap_or_default(),
            failed_stage = %state.failed_stage.unwrap_or_default(),
            failure_reason = %state.failure_reason.unwrap_or_default(),
            last_completed_run_id = %state.last_completed_run_id.unwrap_or_default(),
            last_detail = %last_entry.map(|entry| entry.detail.as_str()).unwrap_or_default(),
            lock_held = ledger.lock_path().exists(),
            "loaded run-state manifest"
        );
    } else {
        warn!(path = %ledger.path().display(), "run-state manifest missing");
    }

    match read_json_if_exists::<SourceInventoryManifest>(&inventory_path)? {
        Some(inventory) => info!(
            generated_at = %inventory.generated_at,
            file_count = inventory.file_count,
            "loaded inventory manifest"
        ),
        None => warn!(path = %inventory_path.display(), "inventory manifest missing"),
    }

    if db_path.exists() {
        let connection = open_store_read_only(&db_path)?;
        let counts = StoreCounts::read(&connection)?;

        info!(
            path = %db_path.display(),
            active_contacts = counts.active_contacts,
            archived_contacts = counts.archived_contacts,
            clusters = counts.clusters,
            secondary_rows = counts.secondary_rows,
            manual_matches = counts.manual_matches,
            scored_clusters = counts.scored_clusters,
            "store status"
        );
    } else {
        warn!(path = %db_path.display(), "store file missing");
    }

    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct StoreCounts {
    active_contacts: i64,
    archived_contacts: i64,
    clusters: i64,
    secondary_rows: i64,
    manual_matches: i64,
    scored_clusters: i64,
}

impl StoreCounts {
    fn read(connection: &Connection) -> Result<Self> {
        Ok(Self {
            active_contacts: count_rows(
                connection,
                "SELECT COUNT(*) FROM canonical_contacts WHERE archived_date IS NULL",
            )?,
            archived_contacts: count_rows(
                connection,
                "SELECT COUNT(*) FROM canonical_contacts WHERE archived_date IS NOT NULL",
            )?,
            clusters: count_rows(
                connection,
                "SELECT COUNT(DISTINCT matching_id) FROM canonical_contacts WHERE archived_date IS NULL",
            )?,
            secondary_rows: count_rows(connection, "SELECT COUNT(*) FROM source_rows")?,
            manual_matches: count_rows(connection, "SELECT COUNT(*) FROM manual_matches")?,
            scored_clusters: count_rows(connection, "SELECT COUNT(*) FROM rfm_scores")?,
        })
    }
}
