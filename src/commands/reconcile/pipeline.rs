use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction};
use tracing::{error, info, warn};

use super::archive::archive_updated;
use super::classify::{classify, collapse_duplicate_keys};
use super::error::ReconcileError;
use super::ledger::{JobLedger, RunId, RunStage, RunStatus};
use super::loader::{LoadedSource, load_source_file};
use super::matcher::match_and_insert;
use super::records::{NaturalKey, NormalizedRecord, RawRowPayload};
use super::registry::{SourceRegistry, SourceRole, SourceType};
use super::scorer::Scorer;
use super::store::{
    insert_source_rows, load_prior_snapshot, touch_updated_at, upsert_manual_matches,
    write_back_json,
};
use crate::model::{ReconcileCounts, ScoringSummary, SourceFileEntry};
use crate::util::now_utc_string;

/// One raw file offered to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file_name: String,
    pub sha256: String,
    pub size_bytes: u64,
}

impl SourceFile {
    pub fn to_entry(&self, source_type: Option<SourceType>) -> SourceFileEntry {
        SourceFileEntry {
            file_name: self.file_name.clone(),
            path: self.path.display().to_string(),
            source_type: source_type.map(|source_type| source_type.as_str().to_string()),
            sha256: self.sha256.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

pub trait FileSource {
    fn describe(&self) -> String;

    /// Available files, ordered by file name.
    fn list_files(&self) -> Result<Vec<SourceFile>>;
}

/// Hands out a store connection for the duration of one run.
pub trait StoreProvider {
    fn open(&self) -> Result<Connection>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    NothingToDo,
    Busy,
    Error,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NothingToDo => "nothing to do",
            Self::Busy => "busy",
            Self::Error => "error",
        }
    }

    /// Ledger status a run with this outcome ends in. Busy runs never reach
    /// the ledger.
    pub fn terminal_status(self) -> Option<RunStatus> {
        match self {
            Self::Completed | Self::NothingToDo => Some(RunStatus::Complete),
            Self::Error => Some(RunStatus::Error),
            Self::Busy => None,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Option<RunId>,
    pub outcome: RunOutcome,
    pub started_at: String,
    pub finished_at: String,
    pub failed_stage: Option<RunStage>,
    pub failure_reason: Option<String>,
    pub counts: ReconcileCounts,
    pub scoring: ScoringSummary,
    pub inputs: Vec<SourceFileEntry>,
    pub warnings: Vec<String>,
}

impl RunReport {
    fn new(run_id: Option<RunId>, started_at: String) -> Self {
        Self {
            run_id,
            outcome: RunOutcome::Error,
            started_at,
            finished_at: String::new(),
            failed_stage: None,
            failure_reason: None,
            counts: ReconcileCounts::default(),
            scoring: ScoringSummary {
                skipped: true,
                scored: None,
                error: None,
            },
            inputs: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Contact records of one run plus their raw payloads, before classification.
#[derive(Debug, Default)]
struct ContactBatch {
    records: Vec<NormalizedRecord>,
    payloads: BTreeMap<NaturalKey, RawRowPayload>,
}

pub struct Orchestrator<'a> {
    registry: &'a SourceRegistry,
    ledger: &'a mut dyn JobLedger,
    files: &'a dyn FileSource,
    store: &'a dyn StoreProvider,
    scorer: Option<&'a dyn Scorer>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        registry: &'a SourceRegistry,
        ledger: &'a mut dyn JobLedger,
        files: &'a dyn FileSource,
        store: &'a dyn StoreProvider,
    ) -> Self {
        Self {
            registry,
            ledger,
            files,
            store,
            scorer: None,
        }
    }

    pub fn with_scorer(mut self, scorer: &'a dyn Scorer) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Runs one reconciliation and returns its terminal report. `Err` is only
    /// returned when the ledger itself cannot be read or written.
    pub fn run(&mut self) -> Result<RunReport> {
        let started_at = now_utc_string();
        let Some(run_id) = self.ledger.begin_run()? else {
            info!("reconciliation skipped: another run holds the ledger");
            let mut report = RunReport::new(None, started_at);
            report.outcome = RunOutcome::Busy;
            report.finished_at = now_utc_string();
            return Ok(report);
        };

        let mut report = RunReport::new(Some(run_id.clone()), started_at);
        let mut stage = RunStage::Start;

        let detail = match self.execute(&run_id, &mut stage, &mut report) {
            Ok(outcome) => {
                report.outcome = outcome;
                match outcome {
                    RunOutcome::NothingToDo => "no source files".to_string(),
                    _ => String::new(),
                }
            }
            Err(err) => {
                let reason = format!("{err:#}");
                error!(run_id = %run_id, stage = %stage, error = %reason, "reconciliation failed");
                report.outcome = RunOutcome::Error;
                report.failed_stage = Some(stage);
                report.failure_reason = Some(reason.clone());
                reason
            }
        };

        if let Some(status) = report.outcome.terminal_status() {
            let terminal_stage = match status {
                RunStatus::Error => RunStage::Error,
                _ => RunStage::Complete,
            };
            self.ledger
                .log_status(&run_id, terminal_stage, status, &detail)?;
        }

        report.finished_at = now_utc_string();
        info!(
            run_id = %run_id,
            outcome = %report.outcome,
            contacts_inserted = report.counts.contacts_inserted,
            archived = report.counts.archived,
            "reconciliation finished"
        );
        Ok(report)
    }

    fn enter(&mut self, run_id: &RunId, current: &mut RunStage, next: RunStage) -> Result<()> {
        *current = next;
        info!(run_id = %run_id, stage = %next, "stage started");
        self.ledger
            .log_status(run_id, next, RunStatus::Executing, "")
    }

    fn execute(
        &mut self,
        run_id: &RunId,
        stage: &mut RunStage,
        report: &mut RunReport,
    ) -> Result<RunOutcome> {
        let files = self
            .files
            .list_files()
            .with_context(|| format!("failed to list files in {}", self.files.describe()))?;
        report.inputs = files
            .iter()
            .map(|file| file.to_entry(self.registry.detect(&file.file_name)))
            .collect();

        if files.is_empty() {
            info!(run_id = %run_id, source = %self.files.describe(), "no source files, nothing to do");
            return Ok(RunOutcome::NothingToDo);
        }

        let mut connection = self.store.open()?;
        let run_at = now_utc_string();

        {
            let tx = connection
                .transaction()
                .context("failed to open run transaction")?;

            self.enter(run_id, stage, RunStage::Loading)?;
            let batch = self.load_all(&tx, &files, run_id, &run_at, report)?;

            self.enter(run_id, stage, RunStage::Classifying)?;
            let (records, collapsed) = collapse_duplicate_keys(batch.records);
            if collapsed > 0 {
                warn!(run_id = %run_id, duplicates = collapsed, "duplicate natural keys collapsed, last row wins");
                report
                    .warnings
                    .push(format!("{collapsed} duplicate natural keys collapsed"));
            }
            report.counts.contact_records = records.len();
            report.counts.duplicate_keys_collapsed = collapsed;

            let prior = load_prior_snapshot(&tx, &self.registry.contact_source_types())?;
            let classification = classify(self.registry, &prior, records)?;
            report.counts.unchanged = classification.unchanged.len();
            report.counts.updated = classification.updated.len();
            report.counts.new = classification.new.len();
            info!(
                run_id = %run_id,
                unchanged = classification.unchanged.len(),
                updated = classification.updated.len(),
                new = classification.new.len(),
                "classified contacts"
            );

            self.enter(run_id, stage, RunStage::Archiving)?;
            let archived = archive_updated(&tx, &classification.updated, &run_at)?;
            report.counts.archived = archived.archived;
            if archived.already_archived > 0 {
                report.warnings.push(format!(
                    "{} updated records had no active row to archive",
                    archived.already_archived
                ));
            }

            self.enter(run_id, stage, RunStage::Matching)?;
            let matched =
                match_and_insert(&tx, self.registry, &classification, run_id.as_str(), &run_at)?;
            report.counts.contacts_inserted = matched.inserted;
            report.counts.manual_matches_applied = matched.manual;
            report.counts.historical_matches = matched.historical;
            report.counts.fuzzy_matches = matched.fuzzy;
            report.counts.ambiguous_matches = matched.ambiguous;
            report.counts.identities_created = matched.created;
            if matched.ambiguous > 0 {
                report.warnings.push(format!(
                    "{} ambiguous identity matches resolved to new identities",
                    matched.ambiguous
                ));
            }

            self.enter(run_id, stage, RunStage::JsonWriteback)?;
            let payloads: Vec<RawRowPayload> = batch.payloads.into_values().collect();
            report.counts.json_rows_written = write_back_json(&tx, &payloads)?;

            touch_updated_at(&tx)?;
            tx.commit().context("failed to commit run transaction")?;
        }

        // Committed from here on, so ledger trouble only warns.
        *stage = RunStage::Scoring;
        info!(run_id = %run_id, stage = %RunStage::Scoring, "stage started");
        self.log_after_commit(run_id, "", report);
        self.run_scorer(run_id, &mut connection, report);

        Ok(RunOutcome::Completed)
    }

    /// Loading stage: contact files are gathered for classification, the
    /// other roles are written straight into their tables.
    fn load_all(
        &self,
        tx: &Transaction<'_>,
        files: &[SourceFile],
        run_id: &RunId,
        run_at: &str,
        report: &mut RunReport,
    ) -> Result<ContactBatch> {
        let mut batch = ContactBatch::default();

        for file in files {
            let source_type = self
                .registry
                .detect(&file.file_name)
                .ok_or_else(|| ReconcileError::UnknownSourceType(file.file_name.clone()))?;
            let role = self.registry.descriptor(source_type)?.role;
            let loaded = load_source_file(self.registry, source_type, &file.path)?;

            report.counts.files_loaded += 1;
            if loaded.skipped_rows > 0 {
                report.warnings.push(format!(
                    "{}: {} rows without a record id skipped",
                    file.file_name, loaded.skipped_rows
                ));
            }
            info!(
                run_id = %run_id,
                file = %file.file_name,
                source_type = %source_type,
                role = role.as_str(),
                rows = loaded.records.len(),
                "loaded source file"
            );

            match role {
                SourceRole::Contacts => {
                    for payload in loaded.raw_rows {
                        batch.payloads.insert(
                            NaturalKey::new(payload.source_type, payload.source_id.clone()),
                            payload,
                        );
                    }
                    batch.records.extend(loaded.records);
                }
                SourceRole::VolunteerShifts | SourceRole::Donations => {
                    report.counts.secondary_rows_inserted += insert_source_rows(
                        tx,
                        &loaded.records,
                        &loaded.raw_rows,
                        run_at,
                        run_id.as_str(),
                    )?;
                }
                SourceRole::ManualMatches => {
                    let entries = self.manual_match_entries(&loaded)?;
                    report.counts.manual_matches_loaded +=
                        upsert_manual_matches(tx, &entries, run_id.as_str())?;
                }
            }
        }

        Ok(batch)
    }

    fn manual_match_entries(&self, loaded: &LoadedSource) -> Result<Vec<(NaturalKey, i64)>> {
        let malformed = |reason: String| ReconcileError::MalformedFile {
            path: loaded.path.clone(),
            reason,
        };

        let mut entries = Vec::with_capacity(loaded.records.len());
        for record in &loaded.records {
            let raw_type = record.field("source_type").unwrap_or_default();
            let descriptor = self
                .registry
                .describe(&raw_type.to_ascii_lowercase())
                .map_err(|_| malformed(format!("unknown source type {raw_type:?}")))?;
            let source_type = descriptor.source_type;
            if descriptor.role != SourceRole::Contacts {
                return Err(malformed(format!(
                    "{source_type} records cannot be matched manually"
                ))
                .into());
            }

            let raw_id = record.field("matching_id").unwrap_or_default();
            let matching_id = parse_matching_id(raw_id).ok_or_else(|| {
                malformed(format!(
                    "invalid matching id {raw_id:?} for {source_type}/{}",
                    record.source_id
                ))
            })?;

            entries.push((NaturalKey::new(source_type, record.source_id.clone()), matching_id));
        }

        Ok(entries)
    }

    fn log_after_commit(&mut self, run_id: &RunId, detail: &str, report: &mut RunReport) {
        if let Err(err) =
            self.ledger
                .log_status(run_id, RunStage::Scoring, RunStatus::Executing, detail)
        {
            let reason = format!("{err:#}");
            warn!(run_id = %run_id, error = %reason, "ledger update failed after commit");
            report
                .warnings
                .push(format!("ledger update failed after commit: {reason}"));
        }
    }

    fn run_scorer(&mut self, run_id: &RunId, connection: &mut Connection, report: &mut RunReport) {
        let Some(scorer) = self.scorer else {
            info!(run_id = %run_id, "scoring skipped");
            return;
        };

        report.scoring.skipped = false;
        match scorer.score(connection) {
            Ok(scored) => {
                report.scoring.scored = Some(scored);
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(run_id = %run_id, scorer = scorer.name(), error = %reason, "scoring failed; reconciliation stays committed");
                report.scoring.error = Some(reason.clone());
                report.warnings.push(format!("scoring failed: {reason}"));
                self.log_after_commit(run_id, &format!("scoring failed: {reason}"), report);
            }
        }
    }
}

/// Accepts `12` and spreadsheet spellings like `12.0`.
fn parse_matching_id(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<i64>() {
        return (value > 0).then_some(value);
    }

    let value = raw.parse::<f64>().ok()?;
    if value.is_finite() && value.fract() == 0.0 && value >= 1.0 && value <= i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}
