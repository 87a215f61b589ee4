use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::InventoryArgs;
use crate::commands::reconcile::{FileSource, SourceFile, SourceRegistry};
use crate::model::{SourceFileEntry, SourceInventoryManifest};
use crate::util::{now_utc_string, sha256_file, write_json_pretty};

pub fn run(args: InventoryArgs) -> Result<()> {
    let registry = SourceRegistry::builtin()?;
    let source = DirectoryFileSource::new(args.layout.raw_dir());
    let manifest = build_manifest(&source, &registry)?;

    let unknown = manifest
        .files
        .iter()
        .filter(|entry| entry.source_type.is_none())
        .count();
    if unknown > 0 {
        warn!(files = unknown, "files with no registered source type");
    }

    if args.dry_run {
        for entry in &manifest.files {
            info!(
                file = %entry.file_name,
                source_type = %entry.source_type.as_deref().unwrap_or("unknown"),
                sha256 = %entry.sha256,
                "source file"
            );
        }
        info!(
            file_count = manifest.file_count,
            source = %manifest.source_directory,
            "inventory dry-run complete"
        );
        return Ok(());
    }

    let manifest_path = args.layout.manifest_dir().join("source_inventory.json");
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote inventory manifest");
    info!(file_count = manifest.file_count, "inventory completed");

    Ok(())
}

pub fn build_manifest(
    source: &dyn FileSource,
    registry: &SourceRegistry,
) -> Result<SourceInventoryManifest> {
    let files = source.list_files()?;
    let entries: Vec<SourceFileEntry> = files
        .iter()
        .map(|file| file.to_entry(registry.detect(&file.file_name)))
        .collect();

    Ok(SourceInventoryManifest {
        manifest_version: 1,
        generated_at: now_utc_string(),
        source_directory: source.describe(),
        file_count: entries.len(),
        files: entries,
    })
}

/// `*.csv` files directly inside one directory. A missing directory lists as
/// empty.
#[derive(Debug, Clone)]
pub struct DirectoryFileSource {
    root: PathBuf,
}

impl DirectoryFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileSource for DirectoryFileSource {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn list_files(&self) -> Result<Vec<SourceFile>> {
        if !self.root.exists() {
            warn!(path = %self.root.display(), "raw directory missing");
            return Ok(Vec::new());
        }

        let mut paths = discover_csvs(&self.root)?;
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let file_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(ToOwned::to_owned)
                .with_context(|| format!("invalid UTF-8 filename: {}", path.display()))?;
            let size_bytes = fs::metadata(&path)
                .with_context(|| format!("failed to stat {}", path.display()))?
                .len();
            let sha256 = sha256_file(&path)?;

            files.push(SourceFile {
                path,
                file_name,
                sha256,
                size_bytes,
            });
        }

        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(files)
    }
}

fn discover_csvs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut csvs = Vec::new();

    let entries =
        fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", root.display()))?;
        let path = entry.path();

        if !entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_file()
        {
            continue;
        }

        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);

        if is_csv {
            csvs.push(path);
        }
    }

    Ok(csvs)
}
