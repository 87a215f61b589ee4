use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::registry::{IdentityMapping, SourceType};

/// A source's own primary key: (`source_type`, `source_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub source_type: SourceType,
    pub source_id: String,
}

impl NaturalKey {
    pub fn new(source_type: SourceType, source_id: impl Into<String>) -> Self {
        Self {
            source_type,
            source_id: source_id.into(),
        }
    }
}

/// One incoming row keyed by canonical column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub source_type: SourceType,
    pub source_id: String,
    pub fields: BTreeMap<String, String>,
}

impl NormalizedRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(self.source_type, self.source_id.clone())
    }

    /// Field value, with empty cells reading as absent.
    pub fn field(&self, column: &str) -> Option<&str> {
        self.fields
            .get(column)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn contact_fields(&self, mapping: &IdentityMapping) -> ContactFields {
        let pick = |column: &Option<String>| {
            column
                .as_deref()
                .and_then(|column| self.field(column))
                .map(str::to_string)
        };

        ContactFields {
            first_name: pick(&mapping.first_name),
            last_name: pick(&mapping.last_name),
            email: pick(&mapping.email),
            mobile: pick(&mapping.mobile),
            street: pick(&mapping.street),
            apartment: pick(&mapping.apartment),
            city: pick(&mapping.city),
            state: pick(&mapping.state),
            zip: pick(&mapping.zip),
        }
    }
}

/// The untouched source row, kept for the `json` column of the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRowPayload {
    pub source_type: SourceType,
    pub source_id: String,
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactFields {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub mobile: Option<String>,
    pub street: Option<String>,
    pub apartment: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

/// Comparison form of a cell: trimmed, empty as `None`, and numbers reduced to
/// one decimal spelling so `42`, `042`, `42.0` and `4.2e1` compare equal.
/// Digits are kept exactly; nothing goes through a float.
pub fn comparable_value(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        return None;
    }

    let number = looks_numeric(trimmed)
        .then(|| canonical_decimal(trimmed))
        .flatten();
    Some(number.unwrap_or_else(|| trimmed.to_string()))
}

fn looks_numeric(value: &str) -> bool {
    value.chars().any(|ch| ch.is_ascii_digit())
        && value
            .chars()
            .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | '-' | '+' | 'e' | 'E'))
}

const MAX_EXPONENT: i64 = 4096;

/// Plain decimal form of `[+-]digits[.digits][e[+-]digits]`, or `None` when
/// the text is not a well-formed number.
fn canonical_decimal(text: &str) -> Option<String> {
    let (negative, unsigned) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(at) => (&unsigned[..at], unsigned[at + 1..].parse::<i64>().ok()?),
        None => (unsigned, 0),
    };
    if exponent.abs() > MAX_EXPONENT {
        return None;
    }

    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part
        .chars()
        .chain(frac_part.chars())
        .all(|ch| ch.is_ascii_digit())
    {
        return None;
    }

    let all_digits = format!("{int_part}{frac_part}");
    let significant = all_digits.trim_start_matches('0');
    let leading_zeros = (all_digits.len() - significant.len()) as i64;
    let digits = significant.trim_end_matches('0');
    if digits.is_empty() {
        return Some("0".to_string());
    }

    // Position of the decimal point within `digits`.
    let point = int_part.len() as i64 + exponent - leading_zeros;
    let len = digits.len() as i64;
    let body = if point <= 0 {
        format!("0.{}{digits}", "0".repeat((-point) as usize))
    } else if point >= len {
        format!("{digits}{}", "0".repeat((point - len) as usize))
    } else {
        let (whole, fraction) = digits.split_at(point as usize);
        format!("{whole}.{fraction}")
    };

    Some(if negative { format!("-{body}") } else { body })
}
