use anyhow::{Context, Result};
use regex::Regex;

/// Turns raw export headers into snake-case column tokens.
///
/// `Opportunity ID (18 Digit)` becomes `opportunity_id`,
/// `Mailing Zip/Postal Code` becomes `mailing_zip_postal_code`. The rewrite
/// is total and idempotent, so an already canonical token passes through
/// unchanged.
#[derive(Debug, Clone)]
pub struct ColumnCanonicalizer {
    parenthetical: Regex,
    dot_runs: Regex,
}

impl ColumnCanonicalizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            parenthetical: Regex::new(r"\s\(.*\)")
                .context("failed to compile parenthetical annotation regex")?,
            dot_runs: Regex::new(r"\.+").context("failed to compile dot run regex")?,
        })
    }

    pub fn canonicalize(&self, header: &str) -> String {
        let stripped = self.parenthetical.replace_all(header, "");
        let lowered = stripped
            .to_lowercase()
            .trim()
            .replace(' ', "_")
            .replace('/', "_");
        let collapsed = self.dot_runs.replace_all(&lowered, "_");
        collapsed.replace('#', "num")
    }
}
