use std::collections::{BTreeMap, HashMap};

use super::error::ReconcileError;
use super::records::{NaturalKey, NormalizedRecord, comparable_value};
use super::registry::SourceRegistry;

/// An active stored contact reduced to what classification compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorContact {
    pub internal_id: i64,
    pub matching_id: i64,
    pub key: NaturalKey,
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationResult {
    pub unchanged: Vec<NormalizedRecord>,
    pub updated: Vec<NormalizedRecord>,
    pub new: Vec<NormalizedRecord>,
}

/// Partitions `incoming` against the active snapshot.
///
/// Every record lands in exactly one bucket and each bucket is ordered by
/// natural key, so the result does not depend on input row order.
pub fn classify(
    registry: &SourceRegistry,
    prior: &[PriorContact],
    incoming: Vec<NormalizedRecord>,
) -> Result<ClassificationResult, ReconcileError> {
    let mut prior_by_key: HashMap<&NaturalKey, &PriorContact> = HashMap::with_capacity(prior.len());
    for contact in prior {
        let slot = prior_by_key.entry(&contact.key).or_insert(contact);
        if contact.internal_id > slot.internal_id {
            *slot = contact;
        }
    }

    let mut result = ClassificationResult::default();
    for record in incoming {
        let Some(existing) = prior_by_key.get(&record.natural_key()) else {
            result.new.push(record);
            continue;
        };

        let descriptor = registry.descriptor(record.source_type)?;
        let changed = descriptor.tracked_columns().into_iter().any(|column| {
            comparable_value(existing.fields.get(column).map(String::as_str))
                != comparable_value(record.fields.get(column).map(String::as_str))
        });

        if changed {
            result.updated.push(record);
        } else {
            result.unchanged.push(record);
        }
    }

    sort_records(&mut result.unchanged);
    sort_records(&mut result.updated);
    sort_records(&mut result.new);

    Ok(result)
}

/// Keeps the last record seen for each natural key and reports how many
/// earlier duplicates were discarded.
pub fn collapse_duplicate_keys(records: Vec<NormalizedRecord>) -> (Vec<NormalizedRecord>, usize) {
    let total = records.len();
    let mut latest: BTreeMap<NaturalKey, NormalizedRecord> = BTreeMap::new();
    for record in records {
        latest.insert(record.natural_key(), record);
    }

    let collapsed = total - latest.len();
    (latest.into_values().collect(), collapsed)
}

fn sort_records(records: &mut [NormalizedRecord]) {
    records.sort_by(|left, right| {
        (left.source_type, &left.source_id, &left.fields)
            .cmp(&(right.source_type, &right.source_id, &right.fields))
    });
}
