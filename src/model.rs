use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFileEntry {
    pub file_name: String,
    pub path: String,
    pub source_type: Option<String>,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInventoryManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub source_directory: String,
    pub file_count: usize,
    pub files: Vec<SourceFileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLogEntry {
    pub run_id: String,
    pub stage: String,
    pub status: String,
    pub detail: String,
    pub logged_at: String,
}

/// On-disk job ledger: the latest run and the stages it has reported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStateManifest {
    pub active_run_id: Option<String>,
    pub current_stage: Option<String>,
    pub status: Option<String>,
    pub started_at: Option<String>,
    pub updated_at: Option<String>,
    pub failed_stage: Option<String>,
    pub failure_reason: Option<String>,
    pub last_completed_run_id: Option<String>,
    #[serde(default)]
    pub stage_log: Vec<StageLogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileCounts {
    pub files_loaded: usize,
    pub contact_records: usize,
    pub duplicate_keys_collapsed: usize,
    pub secondary_rows_inserted: usize,
    pub manual_matches_loaded: usize,
    pub unchanged: usize,
    pub updated: usize,
    pub new: usize,
    pub archived: usize,
    pub contacts_inserted: usize,
    pub manual_matches_applied: usize,
    pub historical_matches: usize,
    pub fuzzy_matches: usize,
    pub ambiguous_matches: usize,
    pub identities_created: usize,
    pub json_rows_written: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringSummary {
    pub skipped: bool,
    pub scored: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileRunManifest {
    pub manifest_version: u32,
    pub run_id: Option<String>,
    pub outcome: String,
    pub started_at: String,
    pub finished_at: String,
    pub failed_stage: Option<String>,
    pub failure_reason: Option<String>,
    pub db_path: String,
    pub counts: ReconcileCounts,
    pub scoring: ScoringSummary,
    pub inputs: Vec<SourceFileEntry>,
    pub warnings: Vec<String>,
    pub stage_log: Vec<StageLogEntry>,
}
