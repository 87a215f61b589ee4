use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "contact-recon",
    version,
    about = "Reconcile contact exports from multiple sources into one canonical history"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Inventory(InventoryArgs),
    Reconcile(ReconcileArgs),
    Status(StatusArgs),
}

/// Filesystem layout shared by every command.
#[derive(Args, Debug, Clone)]
pub struct LayoutArgs {
    #[arg(long, default_value = ".cache/contact-recon")]
    pub data_root: PathBuf,

    /// Directory scanned for raw CSV exports (default: <data-root>/raw).
    #[arg(long)]
    pub raw_dir: Option<PathBuf>,

    /// Directory for the run ledger and run manifests (default: <data-root>/manifests).
    #[arg(long)]
    pub manifest_dir: Option<PathBuf>,

    /// SQLite store (default: <data-root>/contacts.sqlite).
    #[arg(long)]
    pub db_path: Option<PathBuf>,
}

impl LayoutArgs {
    pub fn raw_dir(&self) -> PathBuf {
        self.raw_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("raw"))
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.manifest_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("manifests"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_root.join("contacts.sqlite"))
    }
}

#[derive(Args, Debug, Clone)]
pub struct InventoryArgs {
    #[command(flatten)]
    pub layout: LayoutArgs,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ReconcileArgs {
    #[command(flatten)]
    pub layout: LayoutArgs,

    /// Skip the RFM scorer after a successful reconciliation.
    #[arg(long, default_value_t = false)]
    pub skip_scoring: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub layout: LayoutArgs,
}
