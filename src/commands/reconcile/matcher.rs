use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, warn};

use super::classify::ClassificationResult;
use super::error::ReconcileError;
use super::records::{ContactFields, NaturalKey, NormalizedRecord};
use super::registry::{SourceRegistry, SourceType};
use super::store::{
    IdentityCandidate, NewContact, insert_contact, latest_matching_id, load_identity_candidates,
    load_manual_matches, max_matching_id,
};

/// Lowest score at which a fuzzy candidate cluster is trusted.
const CONFIDENT_SCORE: u32 = 3;
const EMAIL_WEIGHT: u32 = 2;
const NAME_WEIGHT: u32 = 2;
const PHONE_WEIGHT: u32 = 1;
const ADDRESS_WEIGHT: u32 = 1;
const MIN_PHONE_DIGITS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Manual,
    Historical,
    Fuzzy,
    Fresh,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MatchStats {
    pub inserted: usize,
    pub manual: usize,
    pub historical: usize,
    pub fuzzy: usize,
    pub ambiguous: usize,
    pub created: usize,
}

impl MatchStats {
    fn record(&mut self, source: MatchSource) {
        self.inserted += 1;
        match source {
            MatchSource::Manual => self.manual += 1,
            MatchSource::Historical => self.historical += 1,
            MatchSource::Fuzzy => self.fuzzy += 1,
            MatchSource::Fresh => self.created += 1,
        }
    }
}

/// Assigns a `matching_id` to every new and updated record and inserts one
/// active contact row for each, in natural-key order.
pub fn match_and_insert(
    connection: &Connection,
    registry: &SourceRegistry,
    classification: &ClassificationResult,
    run_id: &str,
    created_date: &str,
) -> Result<MatchStats> {
    let manual = load_manual_matches(connection)?;
    let mut index = IdentityIndex::new(load_identity_candidates(connection)?);
    let mut next_matching_id = max_matching_id(connection)? + 1;
    let mut stats = MatchStats::default();

    let mut pending: Vec<&NormalizedRecord> = classification
        .new
        .iter()
        .chain(classification.updated.iter())
        .collect();
    pending.sort_by(|left, right| {
        (left.source_type, &left.source_id).cmp(&(right.source_type, &right.source_id))
    });

    for record in pending {
        let descriptor = registry.descriptor(record.source_type)?;
        let mapping = descriptor.identity_mapping.as_ref().with_context(|| {
            format!("{} records carry no identity mapping", record.source_type)
        })?;
        let contact = record.contact_fields(mapping);
        let key = record.natural_key();

        let (matching_id, source) = if let Some(matching_id) = manual.get(&key) {
            (*matching_id, MatchSource::Manual)
        } else if let Some(matching_id) = latest_matching_id(connection, &key)? {
            (matching_id, MatchSource::Historical)
        } else {
            match index.best_cluster(record.source_type, &contact) {
                ClusterMatch::Unique(matching_id) => (matching_id, MatchSource::Fuzzy),
                ClusterMatch::Ambiguous { candidates, score } => {
                    let err = ReconcileError::MatchAmbiguous {
                        source_type: key.source_type.to_string(),
                        source_id: key.source_id.clone(),
                        candidates,
                        score,
                    };
                    warn!(error = %err, "creating a new identity instead of guessing");
                    stats.ambiguous += 1;
                    let fresh = next_matching_id;
                    next_matching_id += 1;
                    (fresh, MatchSource::Fresh)
                }
                ClusterMatch::None => {
                    let fresh = next_matching_id;
                    next_matching_id += 1;
                    (fresh, MatchSource::Fresh)
                }
            }
        };

        insert_contact(
            connection,
            &NewContact {
                matching_id,
                record,
                contact: &contact,
                created_date,
                run_id,
            },
        )?;
        debug!(
            source_type = %key.source_type,
            source_id = %key.source_id,
            matching_id,
            via = ?source,
            "matched contact"
        );

        stats.record(source);
        index.push(IdentityCandidate {
            matching_id,
            source_type: record.source_type,
            contact,
        });
    }

    Ok(stats)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMatch {
    None,
    Unique(i64),
    Ambiguous { candidates: Vec<i64>, score: u32 },
}

/// Normalized identity signals of one contact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Evidence {
    email: Option<String>,
    name: Option<String>,
    phone: Option<String>,
    address: Option<String>,
}

impl Evidence {
    fn from_contact(contact: &ContactFields) -> Self {
        Self {
            email: normalize_email(contact.email.as_deref()),
            name: normalize_name(contact.first_name.as_deref(), contact.last_name.as_deref()),
            phone: normalize_phone(contact.mobile.as_deref()),
            address: normalize_address(contact.street.as_deref(), contact.zip.as_deref()),
        }
    }

    fn score_against(&self, other: &Evidence) -> u32 {
        let same = |left: &Option<String>, right: &Option<String>| {
            matches!((left, right), (Some(left), Some(right)) if left == right)
        };

        let mut score = 0;
        if same(&self.email, &other.email) {
            score += EMAIL_WEIGHT;
        }
        if same(&self.name, &other.name) {
            score += NAME_WEIGHT;
        }
        if same(&self.phone, &other.phone) {
            score += PHONE_WEIGHT;
        }
        if same(&self.address, &other.address) {
            score += ADDRESS_WEIGHT;
        }
        score
    }
}

/// Active contacts indexed by each identity signal.
#[derive(Debug, Default)]
struct IdentityIndex {
    entries: Vec<(i64, SourceType, Evidence)>,
    by_signal: HashMap<(u8, String), Vec<usize>>,
    /// Source types present in each cluster.
    cluster_sources: HashMap<i64, HashSet<SourceType>>,
}

impl IdentityIndex {
    fn new(candidates: Vec<IdentityCandidate>) -> Self {
        let mut index = Self::default();
        for candidate in candidates {
            index.push(candidate);
        }
        index
    }

    fn push(&mut self, candidate: IdentityCandidate) {
        let evidence = Evidence::from_contact(&candidate.contact);
        let position = self.entries.len();

        for (tag, signal) in signals(&evidence) {
            self.by_signal
                .entry((tag, signal.to_string()))
                .or_default()
                .push(position);
        }
        self.cluster_sources
            .entry(candidate.matching_id)
            .or_default()
            .insert(candidate.source_type);
        self.entries
            .push((candidate.matching_id, candidate.source_type, evidence));
    }

    /// Best-scoring cluster built from other sources. Clusters already
    /// holding a row of `source_type` are skipped: two ids of one source are
    /// two people.
    fn best_cluster(&self, source_type: SourceType, contact: &ContactFields) -> ClusterMatch {
        let evidence = Evidence::from_contact(contact);

        let mut positions: Vec<usize> = signals(&evidence)
            .into_iter()
            .filter_map(|(tag, signal)| self.by_signal.get(&(tag, signal.to_string())))
            .flatten()
            .copied()
            .collect();
        positions.sort_unstable();
        positions.dedup();

        let mut cluster_scores: BTreeMap<i64, u32> = BTreeMap::new();
        for position in positions {
            let (matching_id, candidate_type, candidate) = &self.entries[position];
            if *candidate_type == source_type {
                continue;
            }
            let holds_same_source = self
                .cluster_sources
                .get(matching_id)
                .is_some_and(|sources| sources.contains(&source_type));
            if holds_same_source {
                continue;
            }

            let score = evidence.score_against(candidate);
            let best = cluster_scores.entry(*matching_id).or_default();
            *best = (*best).max(score);
        }

        let Some(top) = cluster_scores.values().copied().max() else {
            return ClusterMatch::None;
        };
        if top < CONFIDENT_SCORE {
            return ClusterMatch::None;
        }

        let leaders: Vec<i64> = cluster_scores
            .into_iter()
            .filter(|(_, score)| *score == top)
            .map(|(matching_id, _)| matching_id)
            .collect();

        match leaders.as_slice() {
            [single] => ClusterMatch::Unique(*single),
            _ => ClusterMatch::Ambiguous {
                candidates: leaders,
                score: top,
            },
        }
    }
}

fn signals(evidence: &Evidence) -> Vec<(u8, &str)> {
    [
        (0_u8, evidence.email.as_deref()),
        (1, evidence.name.as_deref()),
        (2, evidence.phone.as_deref()),
        (3, evidence.address.as_deref()),
    ]
    .into_iter()
    .filter_map(|(tag, signal)| signal.map(|signal| (tag, signal)))
    .collect()
}

fn normalize_email(email: Option<&str>) -> Option<String> {
    let email = email?.trim().to_lowercase();
    email.contains('@').then_some(email)
}

fn alphanumeric_words(value: &str) -> String {
    value
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let first = alphanumeric_words(first?);
    let last = alphanumeric_words(last?);
    if first.is_empty() || last.is_empty() {
        return None;
    }
    Some(format!("{first}|{last}"))
}

fn normalize_phone(phone: Option<&str>) -> Option<String> {
    let digits: String = phone?.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < MIN_PHONE_DIGITS {
        return None;
    }
    let start = digits.len().saturating_sub(10);
    Some(digits[start..].to_string())
}

fn normalize_address(street: Option<&str>, zip: Option<&str>) -> Option<String> {
    let street = alphanumeric_words(street?);
    let zip: String = zip?.chars().filter(char::is_ascii_digit).take(5).collect();
    if street.is_empty() || zip.len() < 5 {
        return None;
    }
    Some(format!("{street}|{zip}"))
}
