use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use super::canonical::ColumnCanonicalizer;
use super::error::ReconcileError;

/// Columns that describe a stored row rather than the contact itself.
const BOOKKEEPING_COLUMNS: [&str; 7] = [
    "_id",
    "internal_id",
    "matching_id",
    "created_date",
    "archived_date",
    "json",
    "run_id",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceType {
    SalesforceContacts,
    Volgistics,
    ShelterluvPeople,
    VolgisticsShifts,
    SalesforceDonations,
    ManualMatches,
}

impl SourceType {
    pub const ALL: [SourceType; 6] = [
        SourceType::SalesforceContacts,
        SourceType::Volgistics,
        SourceType::ShelterluvPeople,
        SourceType::VolgisticsShifts,
        SourceType::SalesforceDonations,
        SourceType::ManualMatches,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SalesforceContacts => "salesforcecontacts",
            Self::Volgistics => "volgistics",
            Self::ShelterluvPeople => "shelterluvpeople",
            Self::VolgisticsShifts => "volgisticsshifts",
            Self::SalesforceDonations => "salesforcedonations",
            Self::ManualMatches => "manualmatches",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ReconcileError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|source_type| source_type.as_str() == value)
            .ok_or_else(|| ReconcileError::UnknownSourceType(value.to_string()))
    }
}

/// How records of a source flow through a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRole {
    /// Identity-bearing people exports: classified, archived and matched.
    Contacts,
    VolunteerShifts,
    Donations,
    /// Curated `matching_id` overrides consumed by the matcher.
    ManualMatches,
}

impl SourceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contacts => "contacts",
            Self::VolunteerShifts => "volunteer_shifts",
            Self::Donations => "donations",
            Self::ManualMatches => "manual_matches",
        }
    }
}

/// Canonical contact slots and the source column feeding each one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMapping {
    pub source_id: Option<String>,
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

impl IdentityMapping {
    pub fn slots(&self) -> [(&'static str, Option<&str>); 10] {
        [
            ("source_id", self.source_id.as_deref()),
            ("first_name", self.first_name.as_deref()),
            ("last_name", self.last_name.as_deref()),
            ("email", self.email.as_deref()),
            ("mobile", self.mobile.as_deref()),
            ("street", self.street.as_deref()),
            ("apartment", self.apartment.as_deref()),
            ("city", self.city.as_deref()),
            ("state", self.state.as_deref()),
            ("zip", self.zip.as_deref()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub source_type: SourceType,
    pub role: SourceRole,
    pub raw_column_names: Vec<String>,
    pub canonical_columns: Vec<String>,
    pub record_id_field: String,
    pub identity_mapping: Option<IdentityMapping>,
    pub drop_first_column: bool,
}

impl SourceDescriptor {
    /// Canonical columns compared when deciding whether a record changed.
    pub fn tracked_columns(&self) -> Vec<&str> {
        self.canonical_columns
            .iter()
            .map(String::as_str)
            .filter(|column| *column != self.record_id_field)
            .filter(|column| !BOOKKEEPING_COLUMNS.contains(column))
            .collect()
    }
}

/// Static description of one source, before canonicalization.
#[derive(Debug, Clone, Copy)]
pub struct SourceSpec {
    pub source_type: SourceType,
    pub role: SourceRole,
    pub raw_columns: &'static [&'static str],
    pub record_id_field: &'static str,
    pub identity: Option<IdentitySpec>,
    pub drop_first_column: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentitySpec {
    pub source_id: Option<&'static str>,
    pub first_name: Option<&'static str>,
    pub last_name: Option<&'static str>,
    pub email: Option<&'static str>,
    pub mobile: Option<&'static str>,
    pub street: Option<&'static str>,
    pub apartment: Option<&'static str>,
    pub city: Option<&'static str>,
    pub state: Option<&'static str>,
    pub zip: Option<&'static str>,
}

impl IdentitySpec {
    fn to_mapping(self) -> IdentityMapping {
        let own = |value: Option<&'static str>| value.map(str::to_string);
        IdentityMapping {
            source_id: own(self.source_id),
            first_name: own(self.first_name),
            last_name: own(self.last_name),
            email: own(self.email),
            mobile: own(self.mobile),
            street: own(self.street),
            apartment: own(self.apartment),
            city: own(self.city),
            state: own(self.state),
            zip: own(self.zip),
        }
    }
}

pub const BUILTIN_SOURCES: [SourceSpec; 6] = [
    SourceSpec {
        source_type: SourceType::SalesforceContacts,
        role: SourceRole::Contacts,
        raw_columns: &[
            "Contact ID",
            "First Name",
            "Last Name",
            "Mailing Street",
            "Mailing City",
            "Mailing State/Province",
            "Mailing Zip/Postal Code",
            "Mailing Country",
            "Phone",
            "Mobile",
            "Email",
        ],
        record_id_field: "contact_id",
        identity: Some(IdentitySpec {
            source_id: Some("contact_id"),
            first_name: Some("first_name"),
            last_name: Some("last_name"),
            email: Some("email"),
            mobile: Some("mobile"),
            street: Some("mailing_street"),
            apartment: Some("mailing_street"),
            city: Some("mailing_city"),
            state: Some("mailing_state_province"),
            zip: Some("mailing_zip_postal_code"),
        }),
        drop_first_column: true,
    },
    SourceSpec {
        source_type: SourceType::Volgistics,
        role: SourceRole::Contacts,
        raw_columns: &[
            "Last name",
            "First name",
            "Middle name",
            "Number",
            "Complete address",
            "Street 1",
            "Street 2",
            "Street 3",
            "City",
            "State",
            "Zip",
            "All phone numbers",
            "Home",
            "Work",
            "Cell",
            "Email",
        ],
        record_id_field: "number",
        identity: Some(IdentitySpec {
            source_id: Some("number"),
            first_name: Some("first_name"),
            last_name: Some("last_name"),
            email: Some("email"),
            mobile: Some("cell"),
            street: Some("street_1"),
            apartment: Some("street_1"),
            city: Some("city"),
            state: Some("state"),
            zip: Some("zip"),
        }),
        drop_first_column: true,
    },
    SourceSpec {
        source_type: SourceType::ShelterluvPeople,
        role: SourceRole::Contacts,
        raw_columns: &[
            "Firstname",
            "Lastname",
            "ID",
            "Internal-ID",
            "PreviousIds",
            "Associated",
            "Street",
            "Apartment",
            "City",
            "State",
            "Zip",
            "Email",
            "Phone",
            "Animal_ids",
        ],
        record_id_field: "id",
        identity: Some(IdentitySpec {
            source_id: Some("id"),
            first_name: Some("firstname"),
            last_name: Some("lastname"),
            email: Some("email"),
            mobile: Some("phone"),
            street: Some("street"),
            apartment: Some("apartment"),
            city: Some("city"),
            state: Some("state"),
            zip: Some("zip"),
        }),
        drop_first_column: false,
    },
    SourceSpec {
        source_type: SourceType::VolgisticsShifts,
        role: SourceRole::VolunteerShifts,
        raw_columns: &[
            "Number",
            "Site",
            "Place",
            "Assignment",
            "Role",
            "From",
            "To",
            "Spare date",
            "Spare dropdown",
            "Spare checkbox",
            "Coordinator",
        ],
        record_id_field: "number",
        identity: None,
        drop_first_column: true,
    },
    SourceSpec {
        source_type: SourceType::SalesforceDonations,
        role: SourceRole::Donations,
        raw_columns: &[
            "Recurring donor",
            "Opportunity Owner",
            "Account Name",
            "Opportunity ID (18 Digit)",
            "Account ID (18 digit)",
            "Opportunity Name",
            "Stage",
            "Fiscal Period",
            "Amount",
            "Probability (%)",
            "Age",
            "Close Date",
            "Created Date",
            "Type",
            "Primary Campaign Source",
            "Source",
            "Contact ID (18 Digit)",
            "Primary Contact",
        ],
        record_id_field: "contact_id",
        identity: None,
        drop_first_column: true,
    },
    SourceSpec {
        source_type: SourceType::ManualMatches,
        role: SourceRole::ManualMatches,
        raw_columns: &["Source Type", "Source ID", "Matching ID"],
        record_id_field: "source_id",
        identity: None,
        drop_first_column: false,
    },
];

/// Read-only set of source descriptors, validated once at startup.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    canonicalizer: ColumnCanonicalizer,
    descriptors: BTreeMap<SourceType, SourceDescriptor>,
}

impl SourceRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_specs(&BUILTIN_SOURCES)
    }

    pub fn from_specs(specs: &[SourceSpec]) -> Result<Self> {
        let canonicalizer = ColumnCanonicalizer::new()?;
        let mut descriptors = BTreeMap::new();

        for spec in specs {
            let descriptor = build_descriptor(spec, &canonicalizer)?;
            if descriptors.insert(spec.source_type, descriptor).is_some() {
                return Err(ReconcileError::InvalidRegistry(format!(
                    "{} registered twice",
                    spec.source_type
                ))
                .into());
            }
        }

        Ok(Self {
            canonicalizer,
            descriptors,
        })
    }

    pub fn canonicalizer(&self) -> &ColumnCanonicalizer {
        &self.canonicalizer
    }

    pub fn describe(&self, source_type: &str) -> Result<&SourceDescriptor, ReconcileError> {
        let parsed = source_type.parse::<SourceType>()?;
        self.descriptor(parsed)
    }

    pub fn descriptor(&self, source_type: SourceType) -> Result<&SourceDescriptor, ReconcileError> {
        self.descriptors
            .get(&source_type)
            .ok_or_else(|| ReconcileError::UnknownSourceType(source_type.to_string()))
    }

    /// Source types whose records carry a canonical identity.
    pub fn contact_source_types(&self) -> Vec<SourceType> {
        self.descriptors
            .values()
            .filter(|descriptor| descriptor.role == SourceRole::Contacts)
            .map(|descriptor| descriptor.source_type)
            .collect()
    }

    /// Picks the registered source whose identifier prefixes the file stem,
    /// comparing lowercase alphanumerics only. The longest identifier wins so
    /// `VolgisticsShifts_2021.csv` is not read as `volgistics`.
    pub fn detect(&self, file_name: &str) -> Option<SourceType> {
        let stem = file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(file_name);
        let key: String = stem
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|ch| ch.to_ascii_lowercase())
            .collect();

        self.descriptors
            .keys()
            .copied()
            .filter(|source_type| key.starts_with(source_type.as_str()))
            .max_by_key(|source_type| source_type.as_str().len())
    }
}

fn build_descriptor(
    spec: &SourceSpec,
    canonicalizer: &ColumnCanonicalizer,
) -> Result<SourceDescriptor, ReconcileError> {
    let canonical_columns: Vec<String> = spec
        .raw_columns
        .iter()
        .map(|raw| canonicalizer.canonicalize(raw))
        .collect();

    let mut seen = HashSet::new();
    for column in &canonical_columns {
        if !seen.insert(column.as_str()) {
            return Err(ReconcileError::InvalidRegistry(format!(
                "{}: canonical column '{column}' produced by more than one raw header",
                spec.source_type
            )));
        }
    }

    if !seen.contains(spec.record_id_field) {
        return Err(ReconcileError::InvalidRegistry(format!(
            "{}: record id field '{}' is not a canonical column",
            spec.source_type, spec.record_id_field
        )));
    }

    let identity_mapping = spec.identity.map(IdentitySpec::to_mapping);
    if let Some(mapping) = &identity_mapping {
        for (slot, column) in mapping.slots() {
            let Some(column) = column else {
                continue;
            };
            if !seen.contains(column) {
                return Err(ReconcileError::InvalidRegistry(format!(
                    "{}: identity slot '{slot}' maps to undeclared column '{column}'",
                    spec.source_type
                )));
            }
        }
        if mapping.source_id.as_deref() != Some(spec.record_id_field) {
            return Err(ReconcileError::InvalidRegistry(format!(
                "{}: identity source_id must be the record id field '{}'",
                spec.source_type, spec.record_id_field
            )));
        }
    }

    if spec.role == SourceRole::Contacts && identity_mapping.is_none() {
        return Err(ReconcileError::InvalidRegistry(format!(
            "{}: contact sources need an identity mapping",
            spec.source_type
        )));
    }

    Ok(SourceDescriptor {
        source_type: spec.source_type,
        role: spec.role,
        raw_column_names: spec.raw_columns.iter().map(|raw| raw.to_string()).collect(),
        canonical_columns,
        record_id_field: spec.record_id_field.to_string(),
        identity_mapping,
        drop_first_column: spec.drop_first_column,
    })
}
