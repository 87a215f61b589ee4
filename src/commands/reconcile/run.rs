use anyhow::{Result, bail};
use chrono::Utc;
use tracing::info;

use super::ledger::FileJobLedger;
use super::pipeline::{Orchestrator, RunOutcome, RunReport};
use super::registry::SourceRegistry;
use super::scorer::RfmAggregateScorer;
use super::store::SqliteStoreProvider;
use crate::cli::ReconcileArgs;
use crate::commands::inventory::DirectoryFileSource;
use crate::model::ReconcileRunManifest;
use crate::util::{ensure_directory, utc_compact_string, write_json_pretty};

pub fn run(args: ReconcileArgs) -> Result<()> {
    let manifest_dir = args.layout.manifest_dir();
    let raw_dir = args.layout.raw_dir();
    let db_path = args.layout.db_path();
    ensure_directory(&manifest_dir)?;

    info!(
        raw_dir = %raw_dir.display(),
        db_path = %db_path.display(),
        skip_scoring = args.skip_scoring,
        "starting reconcile"
    );

    let registry = SourceRegistry::builtin()?;
    let mut ledger = FileJobLedger::in_manifest_dir(&manifest_dir);
    let files = DirectoryFileSource::new(&raw_dir);
    let store = SqliteStoreProvider::new(&db_path);
    let scorer = RfmAggregateScorer::new();

    let report = {
        let mut orchestrator = Orchestrator::new(&registry, &mut ledger, &files, &store);
        if !args.skip_scoring {
            orchestrator = orchestrator.with_scorer(&scorer);
        }
        orchestrator.run()?
    };

    let stage_log = match &report.run_id {
        Some(run_id) => ledger
            .state()?
            .stage_log
            .into_iter()
            .filter(|entry| entry.run_id == run_id.as_str())
            .collect(),
        None => Vec::new(),
    };

    let manifest_path = manifest_dir.join(format!("reconcile_run_{}.json", manifest_stamp(&report)));
    let manifest = ReconcileRunManifest {
        manifest_version: 1,
        run_id: report.run_id.as_ref().map(|id| id.as_str().to_string()),
        outcome: report.outcome.as_str().to_string(),
        started_at: report.started_at.clone(),
        finished_at: report.finished_at.clone(),
        failed_stage: report.failed_stage.map(|stage| stage.as_str().to_string()),
        failure_reason: report.failure_reason.clone(),
        db_path: db_path.display().to_string(),
        counts: report.counts.clone(),
        scoring: report.scoring.clone(),
        inputs: report.inputs.clone(),
        warnings: report.warnings.clone(),
        stage_log,
    };
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), outcome = %report.outcome, "wrote reconcile run manifest");

    if report.outcome == RunOutcome::Error {
        bail!(
            "reconciliation failed at stage {}: {}",
            report
                .failed_stage
                .map(|stage| stage.as_str())
                .unwrap_or("unknown"),
            report.failure_reason.as_deref().unwrap_or("no diagnostic")
        );
    }

    Ok(())
}

/// Busy runs have no run id, so their manifests are stamped by wall clock.
fn manifest_stamp(report: &RunReport) -> String {
    match &report.run_id {
        Some(run_id) => run_id
            .as_str()
            .trim_start_matches("run-")
            .to_string(),
        None => format!("busy_{}", utc_compact_string(Utc::now())),
    }
}
