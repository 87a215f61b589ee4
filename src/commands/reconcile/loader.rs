use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::error::ReconcileError;
use super::records::{NormalizedRecord, RawRowPayload};
use super::registry::{SourceDescriptor, SourceRegistry, SourceType};

/// One source file after header validation and canonicalization.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub path: PathBuf,
    pub records: Vec<NormalizedRecord>,
    pub raw_rows: Vec<RawRowPayload>,
    /// Rows dropped because their natural key cell was empty.
    pub skipped_rows: usize,
}

pub fn load_source_file(
    registry: &SourceRegistry,
    source_type: SourceType,
    path: &Path,
) -> Result<LoadedSource, ReconcileError> {
    let file = File::open(path).map_err(|err| ReconcileError::MalformedFile {
        path: path.to_path_buf(),
        reason: format!("cannot open: {err}"),
    })?;
    load_source_reader(registry, source_type, path, file)
}

/// Parses CSV from `reader`; `path` only labels errors and the result.
pub fn load_source_reader<R: Read>(
    registry: &SourceRegistry,
    source_type: SourceType,
    path: &Path,
    reader: R,
) -> Result<LoadedSource, ReconcileError> {
    let descriptor = registry.descriptor(source_type)?;
    let malformed = |reason: String| ReconcileError::MalformedFile {
        path: path.to_path_buf(),
        reason,
    };

    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(reader);

    let raw_headers: Vec<String> = csv_reader
        .headers()
        .map_err(|err| malformed(format!("cannot read header row: {err}")))?
        .iter()
        .enumerate()
        .map(|(index, header)| {
            if index == 0 {
                header.trim_start_matches('\u{feff}').to_string()
            } else {
                header.to_string()
            }
        })
        .collect();

    if raw_headers.iter().all(|header| header.trim().is_empty()) {
        return Err(malformed("missing header row".to_string()));
    }

    let first_kept = usize::from(descriptor.drop_first_column);
    let kept_headers = raw_headers.get(first_kept..).unwrap_or(&[]);
    validate_headers(descriptor, path, kept_headers)?;

    let canonicalizer = registry.canonicalizer();
    let canonical_headers: Vec<String> = kept_headers
        .iter()
        .map(|header| canonicalizer.canonicalize(header))
        .collect();

    let mut loaded = LoadedSource {
        path: path.to_path_buf(),
        records: Vec::new(),
        raw_rows: Vec::new(),
        skipped_rows: 0,
    };

    for (row_index, row) in csv_reader.records().enumerate() {
        let row = row.map_err(|err| malformed(format!("data row {}: {err}", row_index + 1)))?;

        let fields: BTreeMap<String, String> = canonical_headers
            .iter()
            .zip(row.iter().skip(first_kept))
            .map(|(column, value)| (column.clone(), value.trim().to_string()))
            .collect();

        let source_id = fields
            .get(&descriptor.record_id_field)
            .cloned()
            .unwrap_or_default();
        if source_id.is_empty() {
            loaded.skipped_rows += 1;
            continue;
        }

        let json: Map<String, Value> = raw_headers
            .iter()
            .zip(row.iter())
            .map(|(header, value)| (header.clone(), Value::String(value.to_string())))
            .collect();

        loaded.raw_rows.push(RawRowPayload {
            source_type,
            source_id: source_id.clone(),
            json: Value::Object(json),
        });
        loaded.records.push(NormalizedRecord {
            source_type,
            source_id,
            fields,
        });
    }

    if loaded.skipped_rows > 0 {
        warn!(
            source_type = %source_type,
            path = %path.display(),
            skipped = loaded.skipped_rows,
            "skipped rows without a record id"
        );
    }
    debug!(
        source_type = %source_type,
        path = %path.display(),
        records = loaded.records.len(),
        "loaded source file"
    );

    Ok(loaded)
}

/// Header names must equal the registered raw columns as a set. A name that
/// appears twice counts as extra.
fn validate_headers(
    descriptor: &SourceDescriptor,
    path: &Path,
    headers: &[String],
) -> Result<(), ReconcileError> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for header in headers {
        *seen.entry(header.trim()).or_default() += 1;
    }

    let missing: Vec<String> = descriptor
        .raw_column_names
        .iter()
        .filter(|expected| !seen.contains_key(expected.as_str()))
        .cloned()
        .collect();

    let mut extra = Vec::new();
    for header in headers {
        let name = header.trim();
        let expected = descriptor
            .raw_column_names
            .iter()
            .any(|column| column == name);
        if !expected && !extra.iter().any(|existing: &String| existing == name) {
            extra.push(name.to_string());
        }
    }
    for expected in &descriptor.raw_column_names {
        if seen.get(expected.as_str()).copied().unwrap_or(0) > 1 {
            extra.push(format!("{expected} (duplicate)"));
        }
    }

    if missing.is_empty() && extra.is_empty() {
        return Ok(());
    }

    Err(ReconcileError::SchemaMismatch {
        source_type: descriptor.source_type.to_string(),
        path: path.to_path_buf(),
        missing,
        extra,
    })
}
