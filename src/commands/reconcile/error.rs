use std::path::PathBuf;

use thiserror::Error;

/// Failures the reconciliation core distinguishes; everything else travels as
/// an `anyhow` pipeline fault.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("unknown source type: {0}")]
    UnknownSourceType(String),

    #[error(
        "schema mismatch for {source_type} in {}: missing [{}], extra [{}]",
        .path.display(),
        .missing.join(", "),
        .extra.join(", ")
    )]
    SchemaMismatch {
        source_type: String,
        path: PathBuf,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("malformed file {}: {reason}", .path.display())]
    MalformedFile { path: PathBuf, reason: String },

    /// Non-fatal: the matcher logs it and assigns a fresh identity instead.
    #[error(
        "ambiguous identity match for {source_type}/{source_id}: candidate clusters {candidates:?} tie at score {score}"
    )]
    MatchAmbiguous {
        source_type: String,
        source_id: String,
        candidates: Vec<i64>,
        score: u32,
    },

    #[error("invalid source registry: {0}")]
    InvalidRegistry(String),
}
