use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::model::{RunStateManifest, StageLogEntry};
use crate::util::{ensure_directory, now_utc_string, read_json_if_exists, write_json_pretty};

/// Identifier handed out by the ledger for one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Start,
    Loading,
    Classifying,
    Archiving,
    Matching,
    JsonWriteback,
    Scoring,
    Complete,
    Error,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Loading => "loading",
            Self::Classifying => "classifying",
            Self::Archiving => "archiving",
            Self::Matching => "matching",
            Self::JsonWriteback => "json_writeback",
            Self::Scoring => "scoring",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Executing,
    Complete,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run bookkeeping kept outside the store, so nothing written here is undone
/// when a run transaction rolls back.
pub trait JobLedger {
    /// Returns `None` while another run is in flight.
    fn begin_run(&mut self) -> Result<Option<RunId>>;

    fn log_status(
        &mut self,
        run_id: &RunId,
        stage: RunStage,
        status: RunStatus,
        detail: &str,
    ) -> Result<()>;
}

/// Ledger persisted as `run_state.json`.
///
/// Starting a run creates `run_state.lock` next to it with `create_new`, so
/// only one process can get past the busy check at a time. The lock stays on
/// disk until the run logs a terminal status.
#[derive(Debug)]
pub struct FileJobLedger {
    path: PathBuf,
    lock_path: PathBuf,
    holds_lock: bool,
}

impl FileJobLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            holds_lock: false,
        }
    }

    pub fn in_manifest_dir(manifest_dir: &Path) -> Self {
        Self::new(manifest_dir.join("run_state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn state(&self) -> Result<RunStateManifest> {
        Ok(read_json_if_exists(&self.path)?.unwrap_or_default())
    }

    /// `false` when another ledger already holds the lock file.
    fn try_lock(&mut self) -> Result<bool> {
        if let Some(parent) = self.lock_path.parent() {
            ensure_directory(parent)?;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(mut file) => {
                self.holds_lock = true;
                if let Err(err) = writeln!(file, "pid {}", std::process::id()) {
                    self.unlock()?;
                    return Err(err).with_context(|| {
                        format!("failed to write lock file {}", self.lock_path.display())
                    });
                }
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err).with_context(|| {
                format!("failed to create lock file {}", self.lock_path.display())
            }),
        }
    }

    fn unlock(&mut self) -> Result<()> {
        if !self.holds_lock {
            return Ok(());
        }
        self.holds_lock = false;
        fs::remove_file(&self.lock_path)
            .with_context(|| format!("failed to remove lock file {}", self.lock_path.display()))
    }
}

impl JobLedger for FileJobLedger {
    fn begin_run(&mut self) -> Result<Option<RunId>> {
        if !self.try_lock()? {
            warn!(lock = %self.lock_path.display(), "another run holds the ledger lock");
            return Ok(None);
        }

        let mut state = match self.state() {
            Ok(state) => state,
            Err(err) => {
                self.unlock()?;
                return Err(err);
            }
        };

        if state.status.as_deref() == Some(RunStatus::Executing.as_str()) {
            warn!(
                path = %self.path.display(),
                active_run_id = %state.active_run_id.as_deref().unwrap_or_default(),
                stage = %state.current_stage.as_deref().unwrap_or_default(),
                "another run is in flight"
            );
            self.unlock()?;
            return Ok(None);
        }

        let run_id = next_run_id(&state);
        let now = now_utc_string();

        state.active_run_id = Some(run_id.as_str().to_string());
        state.current_stage = Some(RunStage::Start.as_str().to_string());
        state.status = Some(RunStatus::Executing.as_str().to_string());
        state.started_at = Some(now.clone());
        state.updated_at = Some(now.clone());
        state.failed_stage = None;
        state.failure_reason = None;
        state.stage_log = vec![StageLogEntry {
            run_id: run_id.as_str().to_string(),
            stage: RunStage::Start.as_str().to_string(),
            status: RunStatus::Executing.as_str().to_string(),
            detail: String::new(),
            logged_at: now,
        }];

        if let Err(err) = write_json_pretty(&self.path, &state) {
            self.unlock()?;
            return Err(err);
        }
        info!(run_id = %run_id, "run started");
        Ok(Some(run_id))
    }

    fn log_status(
        &mut self,
        run_id: &RunId,
        stage: RunStage,
        status: RunStatus,
        detail: &str,
    ) -> Result<()> {
        let mut state = self.state()?;
        if state.active_run_id.as_deref() != Some(run_id.as_str()) {
            bail!(
                "run {run_id} is not the active run in {} (active: {})",
                self.path.display(),
                state.active_run_id.as_deref().unwrap_or("none")
            );
        }

        let now = now_utc_string();
        state.current_stage = Some(stage.as_str().to_string());
        state.status = Some(status.as_str().to_string());
        state.updated_at = Some(now.clone());

        match status {
            RunStatus::Executing => {}
            RunStatus::Complete => {
                state.last_completed_run_id = Some(run_id.as_str().to_string());
            }
            RunStatus::Error => {
                let failed_stage = state
                    .stage_log
                    .iter()
                    .rev()
                    .find(|entry| entry.status == RunStatus::Executing.as_str())
                    .map(|entry| entry.stage.clone());
                state.failed_stage = failed_stage;
                state.failure_reason = Some(detail.to_string());
            }
        }

        state.stage_log.push(StageLogEntry {
            run_id: run_id.as_str().to_string(),
            stage: stage.as_str().to_string(),
            status: status.as_str().to_string(),
            detail: detail.to_string(),
            logged_at: now,
        });

        write_json_pretty(&self.path, &state)?;
        if status != RunStatus::Executing {
            self.unlock()?;
        }
        Ok(())
    }
}

/// `run-<UTC timestamp with millis>`, suffixed when it would repeat the
/// previous run's id.
fn next_run_id(state: &RunStateManifest) -> RunId {
    let base = format!("run-{}", Utc::now().format("%Y%m%dT%H%M%S%3fZ"));
    let previous = state.active_run_id.as_deref();

    let mut candidate = base.clone();
    let mut suffix = 2;
    while previous == Some(candidate.as_str()) {
        candidate = format!("{base}-{suffix}");
        suffix += 1;
    }
    RunId::new(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_run_refuses_while_executing() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = FileJobLedger::in_manifest_dir(dir.path());

        let first = ledger.begin_run().unwrap().expect("first run starts");
        assert!(ledger.begin_run().unwrap().is_none());

        ledger
            .log_status(&first, RunStage::Complete, RunStatus::Complete, "")
            .unwrap();
        let second = ledger.begin_run().unwrap().expect("next run starts");
        assert_ne!(first, second);
    }

    #[test]
    fn concurrent_begin_run_grants_one_run_id() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        const CONTENDERS: usize = 8;

        for _ in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let state_path = dir.path().join("run_state.json");
            let barrier = Arc::new(Barrier::new(CONTENDERS));

            let handles: Vec<_> = (0..CONTENDERS)
                .map(|_| {
                    let barrier = Arc::clone(&barrier);
                    let state_path = state_path.clone();
                    thread::spawn(move || {
                        let mut ledger = FileJobLedger::new(state_path);
                        barrier.wait();
                        ledger.begin_run().unwrap()
                    })
                })
                .collect();

            let granted: Vec<RunId> = handles
                .into_iter()
                .filter_map(|handle| handle.join().unwrap())
                .collect();
            assert_eq!(granted.len(), 1, "granted {granted:?}");

            let state = FileJobLedger::new(&state_path).state().unwrap();
            assert_eq!(state.active_run_id.as_deref(), Some(granted[0].as_str()));
        }
    }

    #[test]
    fn terminal_status_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = FileJobLedger::in_manifest_dir(dir.path());
        let run_id = ledger.begin_run().unwrap().unwrap();
        assert!(ledger.lock_path().exists());

        ledger
            .log_status(&run_id, RunStage::Loading, RunStatus::Executing, "")
            .unwrap();
        assert!(ledger.lock_path().exists());

        ledger
            .log_status(&run_id, RunStage::Complete, RunStatus::Complete, "")
            .unwrap();
        assert!(!ledger.lock_path().exists());
    }

    #[test]
    fn leftover_executing_state_is_busy_and_keeps_no_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = FileJobLedger::in_manifest_dir(dir.path());
        first.begin_run().unwrap().unwrap();
        fs::remove_file(first.lock_path()).unwrap();

        let mut second = FileJobLedger::in_manifest_dir(dir.path());
        assert!(second.begin_run().unwrap().is_none());
        assert!(!second.lock_path().exists());
    }

    #[test]
    fn error_status_records_failed_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = FileJobLedger::in_manifest_dir(dir.path());
        let run_id = ledger.begin_run().unwrap().unwrap();

        ledger
            .log_status(&run_id, RunStage::Loading, RunStatus::Executing, "")
            .unwrap();
        ledger
            .log_status(&run_id, RunStage::Error, RunStatus::Error, "bad header")
            .unwrap();

        let state = ledger.state().unwrap();
        assert_eq!(state.status.as_deref(), Some("error"));
        assert_eq!(state.current_stage.as_deref(), Some("error"));
        assert_eq!(state.failed_stage.as_deref(), Some("loading"));
        assert_eq!(state.failure_reason.as_deref(), Some("bad header"));
        assert_eq!(state.stage_log.len(), 3);
        assert!(state.last_completed_run_id.is_none());

        assert!(ledger.begin_run().unwrap().is_some(), "error is terminal");
    }

    #[test]
    fn stale_run_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = FileJobLedger::in_manifest_dir(dir.path());
        ledger.begin_run().unwrap().unwrap();

        let err = ledger
            .log_status(
                &RunId::new("run-stale"),
                RunStage::Complete,
                RunStatus::Complete,
                "",
            )
            .unwrap_err();
        assert!(err.to_string().contains("not the active run"));
    }

    #[test]
    fn run_ids_do_not_repeat_within_one_millisecond() {
        let state = RunStateManifest {
            active_run_id: Some(format!("run-{}", Utc::now().format("%Y%m%dT%H%M%S%3fZ"))),
            ..RunStateManifest::default()
        };
        let next = next_run_id(&state);
        assert_ne!(Some(next.as_str()), state.active_run_id.as_deref());
    }
}
