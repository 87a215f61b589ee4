use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, info};

use super::registry::SourceType;
use crate::util::utc_string;

/// Post-reconciliation scoring over the committed store.
pub trait Scorer {
    fn name(&self) -> &str;

    /// Returns the number of scored entities.
    fn score(&self, connection: &mut Connection) -> Result<usize>;
}

/// Raw recency/frequency/monetary aggregates per identity cluster. Binning
/// and weighting are left to downstream consumers of `rfm_scores`.
#[derive(Debug, Clone)]
pub struct RfmAggregateScorer {
    as_of: Option<DateTime<Utc>>,
}

impl RfmAggregateScorer {
    pub fn new() -> Self {
        Self { as_of: None }
    }

    #[cfg(test)]
    pub fn as_of(as_of: DateTime<Utc>) -> Self {
        Self { as_of: Some(as_of) }
    }
}

impl Default for RfmAggregateScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct ClusterAggregate {
    last_donation: Option<NaiveDate>,
    count: i64,
    total: f64,
}

impl Scorer for RfmAggregateScorer {
    fn name(&self) -> &str {
        "rfm_aggregate"
    }

    fn score(&self, connection: &mut Connection) -> Result<usize> {
        let as_of = self.as_of.unwrap_or_else(Utc::now);
        let tx = connection
            .transaction()
            .context("failed to open scoring transaction")?;

        let mut aggregates: BTreeMap<i64, ClusterAggregate> = BTreeMap::new();
        let mut unparsed = 0_usize;
        {
            let mut statement = tx.prepare(
                "
                SELECT contacts.matching_id, donations.fields_json
                FROM source_rows AS donations
                JOIN canonical_contacts AS contacts
                  ON contacts.source_type = ?2
                 AND contacts.source_id = donations.source_id
                 AND contacts.archived_date IS NULL
                WHERE donations.source_type = ?1
                ORDER BY donations.row_id ASC
                ",
            )?;
            let mut rows = statement.query(params![
                SourceType::SalesforceDonations.as_str(),
                SourceType::SalesforceContacts.as_str()
            ])?;

            while let Some(row) = rows.next()? {
                let matching_id: i64 = row.get(0)?;
                let fields_json: String = row.get(1)?;
                let fields: BTreeMap<String, String> = serde_json::from_str(&fields_json)
                    .context("invalid fields_json on donation row")?;

                let Some(amount) = fields.get("amount").and_then(|value| parse_amount(value))
                else {
                    unparsed += 1;
                    continue;
                };
                let date = fields
                    .get("close_date")
                    .and_then(|value| parse_donation_date(value));

                let aggregate = aggregates.entry(matching_id).or_default();
                aggregate.count += 1;
                aggregate.total += amount;
                aggregate.last_donation = aggregate.last_donation.max(date);
            }
        }

        if unparsed > 0 {
            debug!(rows = unparsed, "skipped donations without a parseable amount");
        }

        let scored_at = utc_string(as_of);
        tx.execute("DELETE FROM rfm_scores", [])?;
        {
            let mut insert = tx.prepare(
                "
                INSERT INTO rfm_scores(
                  matching_id, last_donation_date, donation_count, donation_total,
                  recency_days, scored_at
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6)
                ",
            )?;
            for (matching_id, aggregate) in &aggregates {
                let recency_days = aggregate
                    .last_donation
                    .map(|date| (as_of.date_naive() - date).num_days());
                insert.execute(params![
                    matching_id,
                    aggregate
                        .last_donation
                        .map(|date| date.format("%Y-%m-%d").to_string()),
                    aggregate.count,
                    aggregate.total,
                    recency_days,
                    scored_at,
                ])?;
            }
        }
        tx.commit().context("failed to commit rfm scores")?;

        info!(scorer = self.name(), clusters = aggregates.len(), "scored donors");
        Ok(aggregates.len())
    }
}

fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|ch| *ch != '$' && *ch != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|amount| amount.is_finite())
}

fn parse_donation_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date_part = raw.split_whitespace().next()?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%m/%d/%Y"))
        .ok()
}
