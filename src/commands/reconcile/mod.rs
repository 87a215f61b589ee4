mod archive;
mod canonical;
mod classify;
mod error;
mod ledger;
mod loader;
mod matcher;
mod pipeline;
mod records;
mod registry;
mod run;
mod scorer;
mod store;
#[cfg(test)]
mod tests;

pub use ledger::FileJobLedger;
pub use pipeline::{FileSource, SourceFile};
pub use registry::SourceRegistry;
pub use run::run;
pub use store::{count_rows, open_store_read_only};
#[cfg(test)]
pub use store::{ensure_schema, open_store};
