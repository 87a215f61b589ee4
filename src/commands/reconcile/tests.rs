use std::fs;
use std::path::PathBuf;

use anyhow::{Result, bail};
use rusqlite::Connection;
use tempfile::TempDir;

use super::ledger::{FileJobLedger, JobLedger, RunId, RunStage, RunStatus};
use super::pipeline::{Orchestrator, RunOutcome, RunReport};
use super::registry::SourceRegistry;
use super::scorer::{RfmAggregateScorer, Scorer};
use super::store::SqliteStoreProvider;
use crate::commands::inventory::DirectoryFileSource;

const VOLGISTICS_HEADER: &str = ",Last name,First name,Middle name,Number,Complete address,Street 1,Street 2,Street 3,City,State,Zip,All phone numbers,Home,Work,Cell,Email";
const SALESFORCE_HEADER: &str = ",Contact ID,First Name,Last Name,Mailing Street,Mailing City,Mailing State/Province,Mailing Zip/Postal Code,Mailing Country,Phone,Mobile,Email";
const SHELTERLUV_HEADER: &str = "Firstname,Lastname,ID,Internal-ID,PreviousIds,Associated,Street,Apartment,City,State,Zip,Email,Phone,Animal_ids";
const DONATIONS_HEADER: &str = ",Recurring donor,Opportunity Owner,Account Name,Opportunity ID (18 Digit),Account ID (18 digit),Opportunity Name,Stage,Fiscal Period,Amount,Probability (%),Age,Close Date,Created Date,Type,Primary Campaign Source,Source,Contact ID (18 Digit),Primary Contact";
const MANUAL_HEADER: &str = "Source Type,Source ID,Matching ID";

fn volgistics_row(number: &str, first: &str, last: &str, email: &str) -> String {
    format!("0,{last},{first},,{number},,1 Main St,,,Springfield,PA,19000,,,,,{email}")
}

fn salesforce_row(contact_id: &str, first: &str, last: &str, email: &str) -> String {
    format!("0,{contact_id},{first},{last},1 Main St,Springfield,PA,19000,USA,,,{email}")
}

fn shelterluv_row(id: &str, first: &str, last: &str, email: &str) -> String {
    format!("{first},{last},{id},,,,9 Elm St,,Springfield,PA,19001,{email},,")
}

fn donation_row(opportunity: &str, contact_id: &str, amount: &str, close_date: &str) -> String {
    format!("0,,,,{opportunity},,,Closed Won,,{amount},100,,{close_date},,,,,{contact_id},")
}

fn csv(header: &str, rows: &[String]) -> String {
    let mut out = String::from(header);
    out.push('\n');
    for row in rows {
        out.push_str(row);
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredContact {
    source_type: String,
    source_id: String,
    matching_id: i64,
    email: Option<String>,
    archived_date: Option<String>,
    json: Option<String>,
}

struct FailingScorer;

impl Scorer for FailingScorer {
    fn name(&self) -> &str {
        "failing"
    }

    fn score(&self, _connection: &mut Connection) -> Result<usize> {
        bail!("scoring backend unavailable")
    }
}

/// Ledger whose scoring-stage writes fail, as after a full disk.
struct ScoringWriteFailsLedger<'a> {
    inner: &'a mut FileJobLedger,
}

impl JobLedger for ScoringWriteFailsLedger<'_> {
    fn begin_run(&mut self) -> Result<Option<RunId>> {
        self.inner.begin_run()
    }

    fn log_status(
        &mut self,
        run_id: &RunId,
        stage: RunStage,
        status: RunStatus,
        detail: &str,
    ) -> Result<()> {
        if stage == RunStage::Scoring {
            bail!("no space left on device");
        }
        self.inner.log_status(run_id, stage, status, detail)
    }
}

struct Workspace {
    dir: TempDir,
    raw: PathBuf,
    db_path: PathBuf,
    ledger: FileJobLedger,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        fs::create_dir_all(&raw).unwrap();
        let db_path = dir.path().join("contacts.sqlite");
        let ledger = FileJobLedger::in_manifest_dir(&dir.path().join("manifests"));
        Self {
            dir,
            raw,
            db_path,
            ledger,
        }
    }

    fn write(&self, file_name: &str, content: &str) {
        fs::write(self.raw.join(file_name), content).unwrap();
    }

    fn remove(&self, file_name: &str) {
        fs::remove_file(self.raw.join(file_name)).unwrap();
    }

    fn run(&mut self) -> RunReport {
        self.run_scored(None)
    }

    fn run_scored(&mut self, scorer: Option<&dyn Scorer>) -> RunReport {
        let registry = SourceRegistry::builtin().unwrap();
        let files = DirectoryFileSource::new(&self.raw);
        let store = SqliteStoreProvider::new(&self.db_path);

        let mut orchestrator = Orchestrator::new(&registry, &mut self.ledger, &files, &store);
        if let Some(scorer) = scorer {
            orchestrator = orchestrator.with_scorer(scorer);
        }
        orchestrator.run().unwrap()
    }

    fn connection(&self) -> Connection {
        Connection::open(&self.db_path).unwrap()
    }

    fn contacts(&self) -> Vec<StoredContact> {
        let connection = self.connection();
        let mut statement = connection
            .prepare(
                "
                SELECT source_type, source_id, matching_id, email, archived_date, json
                FROM canonical_contacts
                ORDER BY internal_id
                ",
            )
            .unwrap();
        statement
            .query_map([], |row| {
                Ok(StoredContact {
                    source_type: row.get(0)?,
                    source_id: row.get(1)?,
                    matching_id: row.get(2)?,
                    email: row.get(3)?,
                    archived_date: row.get(4)?,
                    json: row.get(5)?,
                })
            })
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn active(&self, source_type: &str, source_id: &str) -> StoredContact {
        let matches: Vec<StoredContact> = self
            .contacts()
            .into_iter()
            .filter(|contact| {
                contact.source_type == source_type
                    && contact.source_id == source_id
                    && contact.archived_date.is_none()
            })
            .collect();
        assert_eq!(matches.len(), 1, "one active row for {source_type}/{source_id}");
        matches[0].clone()
    }

    fn count(&self, sql: &str) -> i64 {
        self.connection().query_row(sql, [], |row| row.get(0)).unwrap()
    }
}

#[test]
fn updated_contact_is_archived_and_reinserted_under_same_identity() {
    let mut workspace = Workspace::new();
    workspace.write(
        "volgistics.csv",
        &csv(VOLGISTICS_HEADER, &[volgistics_row("42", "Ada", "Lovelace", "a@x.com")]),
    );
    let first = workspace.run();
    assert_eq!(first.outcome, RunOutcome::Completed);
    assert_eq!(first.counts.new, 1);
    let original = workspace.active("volgistics", "42");

    workspace.write(
        "volgistics.csv",
        &csv(VOLGISTICS_HEADER, &[volgistics_row("42", "Ada", "Lovelace", "b@x.com")]),
    );
    let second = workspace.run();
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.counts.updated, 1);
    assert_eq!(second.counts.archived, 1);
    assert_eq!(second.counts.historical_matches, 1);
    assert_eq!(second.counts.identities_created, 0);

    let rows = workspace.contacts();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].email.as_deref(), Some("a@x.com"));
    assert!(rows[0].archived_date.is_some());
    assert_eq!(rows[1].email.as_deref(), Some("b@x.com"));
    assert!(rows[1].archived_date.is_none());
    assert_eq!(rows[1].matching_id, original.matching_id);
    assert!(rows[1].json.as_deref().is_some_and(|json| json.contains("b@x.com")));

    let stages: Vec<String> = workspace
        .ledger
        .state()
        .unwrap()
        .stage_log
        .into_iter()
        .map(|entry| entry.stage)
        .collect();
    assert_eq!(
        stages,
        vec![
            "start",
            "loading",
            "classifying",
            "archiving",
            "matching",
            "json_writeback",
            "scoring",
            "complete"
        ]
    );
}

#[test]
fn rerunning_unchanged_input_changes_nothing() {
    let mut workspace = Workspace::new();
    workspace.write(
        "volgistics.csv",
        &csv(
            VOLGISTICS_HEADER,
            &[
                volgistics_row("42", "Ada", "Lovelace", "a@x.com"),
                volgistics_row("43", "Alan", "Turing", "alan@x.com"),
            ],
        ),
    );
    workspace.run();
    let before = workspace.contacts();

    let again = workspace.run();
    assert_eq!(again.outcome, RunOutcome::Completed);
    assert_eq!(again.counts.unchanged, 2);
    assert_eq!(again.counts.new, 0);
    assert_eq!(again.counts.updated, 0);
    assert_eq!(again.counts.archived, 0);
    assert_eq!(again.counts.contacts_inserted, 0);
    assert_eq!(again.counts.json_rows_written, 0);
    assert_eq!(workspace.contacts(), before);
}

#[test]
fn no_files_is_nothing_to_do_without_store_access() {
    let mut workspace = Workspace::new();

    let report = workspace.run();
    assert_eq!(report.outcome, RunOutcome::NothingToDo);
    assert!(!workspace.db_path.exists());

    let state = workspace.ledger.state().unwrap();
    assert_eq!(state.status.as_deref(), Some("complete"));
    assert_eq!(state.current_stage.as_deref(), Some("complete"));
}

#[test]
fn busy_ledger_refuses_without_store_access() {
    let mut workspace = Workspace::new();
    workspace.write(
        "volgistics.csv",
        &csv(VOLGISTICS_HEADER, &[volgistics_row("42", "Ada", "Lovelace", "a@x.com")]),
    );
    let holder = workspace.ledger.begin_run().unwrap().unwrap();

    let report = workspace.run();
    assert_eq!(report.outcome, RunOutcome::Busy);
    assert!(report.run_id.is_none());
    assert!(!workspace.db_path.exists());

    let state = workspace.ledger.state().unwrap();
    assert_eq!(state.active_run_id.as_deref(), Some(holder.as_str()));
    assert_eq!(state.status.as_deref(), Some("executing"));
}

#[test]
fn schema_mismatch_rolls_back_every_write() {
    let mut workspace = Workspace::new();
    workspace.write(
        "volgistics.csv",
        &csv(VOLGISTICS_HEADER, &[volgistics_row("42", "Ada", "Lovelace", "a@x.com")]),
    );
    workspace.run();
    let before = workspace.contacts();

    // donations load (and write) before the broken volgistics file is read
    workspace.write(
        "salesforcedonations.csv",
        &csv(DONATIONS_HEADER, &[donation_row("OPP1", "003A", "25", "2026-01-05")]),
    );
    workspace.write(
        "volgistics.csv",
        "Last name,First name,Number,Email\nLovelace,Ada,42,b@x.com\n",
    );

    let report = workspace.run();
    assert_eq!(report.outcome, RunOutcome::Error);
    assert_eq!(report.failed_stage, Some(RunStage::Loading));
    assert!(
        report
            .failure_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("schema mismatch"))
    );

    assert_eq!(workspace.contacts(), before);
    assert_eq!(workspace.count("SELECT COUNT(*) FROM source_rows"), 0);

    let state = workspace.ledger.state().unwrap();
    assert_eq!(state.status.as_deref(), Some("error"));
    assert_eq!(state.failed_stage.as_deref(), Some("loading"));
}

#[test]
fn unrecognized_file_fails_the_run() {
    let mut workspace = Workspace::new();
    workspace.write("mystery.csv", "a,b\n1,2\n");

    let report = workspace.run();
    assert_eq!(report.outcome, RunOutcome::Error);
    assert!(
        report
            .failure_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("unknown source type"))
    );
}

#[test]
fn same_person_across_sources_shares_one_identity() {
    let mut workspace = Workspace::new();
    workspace.write(
        "salesforcecontacts.csv",
        &csv(SALESFORCE_HEADER, &[salesforce_row("003A", "Ada", "Lovelace", "ada@x.com")]),
    );
    workspace.write(
        "volgistics.csv",
        &csv(VOLGISTICS_HEADER, &[volgistics_row("42", "ADA", "lovelace", "Ada@X.com")]),
    );
    workspace.write(
        "shelterluvpeople.csv",
        &csv(SHELTERLUV_HEADER, &[shelterluv_row("7", "Alan", "Turing", "alan@x.com")]),
    );

    let report = workspace.run();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.counts.fuzzy_matches, 1);
    assert_eq!(report.counts.identities_created, 2);

    let salesforce = workspace.active("salesforcecontacts", "003A");
    let volgistics = workspace.active("volgistics", "42");
    let shelterluv = workspace.active("shelterluvpeople", "7");
    assert_eq!(salesforce.matching_id, volgistics.matching_id);
    assert_ne!(salesforce.matching_id, shelterluv.matching_id);
}

#[test]
fn ambiguous_match_creates_a_new_identity() {
    let mut workspace = Workspace::new();
    workspace.write(
        "salesforcecontacts.csv",
        &csv(
            SALESFORCE_HEADER,
            &[
                salesforce_row("003A", "Sam", "Lee", "sam@x.com"),
                salesforce_row("003B", "Sam", "Lee", "sam@x.com"),
            ],
        ),
    );
    workspace.write(
        "volgistics.csv",
        &csv(VOLGISTICS_HEADER, &[volgistics_row("42", "Sam", "Lee", "sam@x.com")]),
    );

    let report = workspace.run();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.counts.ambiguous_matches, 1);
    assert_eq!(report.counts.identities_created, 3);
    assert!(report.warnings.iter().any(|warning| warning.contains("ambiguous")));

    let first = workspace.active("salesforcecontacts", "003A").matching_id;
    let second = workspace.active("salesforcecontacts", "003B").matching_id;
    let volunteer = workspace.active("volgistics", "42").matching_id;
    assert_ne!(first, second);
    assert_ne!(volunteer, first);
    assert_ne!(volunteer, second);
}

#[test]
fn manual_override_beats_fuzzy_match() {
    let mut workspace = Workspace::new();
    workspace.write("manualmatches.csv", &csv(MANUAL_HEADER, &["Volgistics,42,500".to_string()]));
    workspace.write(
        "salesforcecontacts.csv",
        &csv(SALESFORCE_HEADER, &[salesforce_row("003A", "Ada", "Lovelace", "ada@x.com")]),
    );
    workspace.write(
        "volgistics.csv",
        &csv(VOLGISTICS_HEADER, &[volgistics_row("42", "Ada", "Lovelace", "ada@x.com")]),
    );

    let report = workspace.run();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.counts.manual_matches_loaded, 1);
    assert_eq!(report.counts.manual_matches_applied, 1);
    assert_eq!(report.counts.fuzzy_matches, 0);

    assert_eq!(workspace.active("volgistics", "42").matching_id, 500);
    assert_eq!(workspace.active("salesforcecontacts", "003A").matching_id, 501);
}

#[test]
fn duplicate_keys_collapse_to_the_last_row() {
    let mut workspace = Workspace::new();
    workspace.write(
        "volgistics.csv",
        &csv(
            VOLGISTICS_HEADER,
            &[
                volgistics_row("42", "Ada", "Lovelace", "old@x.com"),
                volgistics_row("42", "Ada", "Lovelace", "new@x.com"),
            ],
        ),
    );

    let report = workspace.run();
    assert_eq!(report.counts.duplicate_keys_collapsed, 1);
    assert_eq!(report.counts.contacts_inserted, 1);
    assert_eq!(
        workspace.active("volgistics", "42").email.as_deref(),
        Some("new@x.com")
    );
}

#[test]
fn scorer_runs_after_commit_and_secondary_rows_load_once() {
    let mut workspace = Workspace::new();
    workspace.write(
        "salesforcecontacts.csv",
        &csv(SALESFORCE_HEADER, &[salesforce_row("003A", "Ada", "Lovelace", "ada@x.com")]),
    );
    workspace.write(
        "salesforcedonations.csv",
        &csv(
            DONATIONS_HEADER,
            &[
                donation_row("OPP1", "003A", "25", "2026-01-05"),
                donation_row("OPP2", "003A", "75.50", "02/01/2026"),
            ],
        ),
    );
    let scorer = RfmAggregateScorer::new();

    let first = workspace.run_scored(Some(&scorer));
    assert_eq!(first.outcome, RunOutcome::Completed);
    assert_eq!(first.counts.secondary_rows_inserted, 2);
    assert_eq!(first.scoring.scored, Some(1));
    assert!(!first.scoring.skipped);

    let second = workspace.run_scored(Some(&scorer));
    assert_eq!(second.counts.secondary_rows_inserted, 0);

    let (count, total): (i64, f64) = workspace
        .connection()
        .query_row(
            "SELECT donation_count, donation_total FROM rfm_scores",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(count, 2);
    assert!((total - 100.5).abs() < 1e-9);
}

#[test]
fn scorer_failure_keeps_the_run_completed() {
    let mut workspace = Workspace::new();
    workspace.write(
        "volgistics.csv",
        &csv(VOLGISTICS_HEADER, &[volgistics_row("42", "Ada", "Lovelace", "a@x.com")]),
    );

    let report = workspace.run_scored(Some(&FailingScorer));
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(
        report
            .scoring
            .error
            .as_deref()
            .is_some_and(|error| error.contains("scoring backend unavailable"))
    );
    assert_eq!(workspace.contacts().len(), 1);
    assert_eq!(
        workspace.ledger.state().unwrap().status.as_deref(),
        Some("complete")
    );
}

#[test]
fn ledger_failure_after_commit_keeps_the_run_completed() {
    let mut workspace = Workspace::new();
    workspace.write(
        "volgistics.csv",
        &csv(VOLGISTICS_HEADER, &[volgistics_row("42", "Ada", "Lovelace", "a@x.com")]),
    );

    let registry = SourceRegistry::builtin().unwrap();
    let files = DirectoryFileSource::new(&workspace.raw);
    let store = SqliteStoreProvider::new(&workspace.db_path);
    let mut ledger = ScoringWriteFailsLedger {
        inner: &mut workspace.ledger,
    };
    let report = Orchestrator::new(&registry, &mut ledger, &files, &store)
        .run()
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.failed_stage.is_none());
    assert!(
        report
            .warnings
            .iter()
            .any(|warning| warning.contains("no space left on device"))
    );
    assert_eq!(workspace.contacts().len(), 1);

    let state = workspace.ledger.state().unwrap();
    assert_eq!(state.status.as_deref(), Some("complete"));
    assert!(!workspace.ledger.lock_path().exists());
}

#[test]
fn removed_file_leaves_contacts_active() {
    let mut workspace = Workspace::new();
    workspace.write(
        "volgistics.csv",
        &csv(VOLGISTICS_HEADER, &[volgistics_row("42", "Ada", "Lovelace", "a@x.com")]),
    );
    workspace.write(
        "shelterluvpeople.csv",
        &csv(SHELTERLUV_HEADER, &[shelterluv_row("7", "Alan", "Turing", "alan@x.com")]),
    );
    workspace.run();

    workspace.remove("shelterluvpeople.csv");
    let report = workspace.run();
    assert_eq!(report.counts.archived, 0);
    assert_eq!(workspace.active("shelterluvpeople", "7").email.as_deref(), Some("alan@x.com"));
    assert!(workspace.dir.path().join("manifests").join("run_state.json").exists());
}
