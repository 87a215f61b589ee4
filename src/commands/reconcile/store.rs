use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use super::classify::PriorContact;
use super::pipeline::StoreProvider;
use super::records::{ContactFields, NaturalKey, NormalizedRecord, RawRowPayload};
use super::registry::SourceType;
use crate::util::{ensure_directory, now_utc_string, sha256_hex};

pub const DB_SCHEMA_VERSION: &str = "1.0.0";

pub fn open_store(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

/// Opens an existing store for reporting. Neither pragmas nor schema setup
/// run, and any write through the connection fails.
pub fn open_store_read_only(db_path: &Path) -> Result<Connection> {
    Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open {} read-only", db_path.display()))
}

/// SQLite file store, opened fresh for every run.
#[derive(Debug, Clone)]
pub struct SqliteStoreProvider {
    db_path: PathBuf,
}

impl SqliteStoreProvider {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

impl StoreProvider for SqliteStoreProvider {
    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_directory(parent)?;
            }
        }
        open_store(&self.db_path)
    }
}

pub fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS canonical_contacts (
              internal_id INTEGER PRIMARY KEY AUTOINCREMENT,
              matching_id INTEGER NOT NULL,
              source_type TEXT NOT NULL,
              source_id TEXT NOT NULL,
              first_name TEXT,
              last_name TEXT,
              email TEXT,
              mobile TEXT,
              street TEXT,
              apartment TEXT,
              city TEXT,
              state TEXT,
              zip TEXT,
              fields_json TEXT NOT NULL,
              json TEXT,
              created_date TEXT NOT NULL,
              archived_date TEXT,
              run_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS source_rows (
              row_id INTEGER PRIMARY KEY AUTOINCREMENT,
              source_type TEXT NOT NULL,
              source_id TEXT NOT NULL,
              row_hash TEXT NOT NULL UNIQUE,
              fields_json TEXT NOT NULL,
              json TEXT NOT NULL,
              created_date TEXT NOT NULL,
              run_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS manual_matches (
              source_type TEXT NOT NULL,
              source_id TEXT NOT NULL,
              matching_id INTEGER NOT NULL,
              run_id TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              PRIMARY KEY(source_type, source_id)
            );

            CREATE TABLE IF NOT EXISTS rfm_scores (
              matching_id INTEGER PRIMARY KEY,
              last_donation_date TEXT,
              donation_count INTEGER NOT NULL,
              donation_total REAL NOT NULL,
              recency_days INTEGER,
              scored_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_active_key
              ON canonical_contacts(source_type, source_id) WHERE archived_date IS NULL;
            CREATE INDEX IF NOT EXISTS idx_contacts_key ON canonical_contacts(source_type, source_id);
            CREATE INDEX IF NOT EXISTS idx_contacts_matching_id ON canonical_contacts(matching_id);
            CREATE INDEX IF NOT EXISTS idx_source_rows_type_id ON source_rows(source_type, source_id);
            ",
        )
        .context("failed to initialize contact store schema")?;

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;

    Ok(())
}

pub fn touch_updated_at(connection: &Connection) -> Result<()> {
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now_utc_string()],
    )?;
    Ok(())
}

/// Active rows of the given source types, with their canonical field maps.
pub fn load_prior_snapshot(
    connection: &Connection,
    source_types: &[SourceType],
) -> Result<Vec<PriorContact>> {
    let mut statement = connection.prepare(
        "
        SELECT internal_id, matching_id, source_type, source_id, fields_json
        FROM canonical_contacts
        WHERE archived_date IS NULL
        ORDER BY internal_id ASC
        ",
    )?;

    let mut rows = statement.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let source_type_raw: String = row.get(2)?;
        let Ok(source_type) = source_type_raw.parse::<SourceType>() else {
            continue;
        };
        if !source_types.contains(&source_type) {
            continue;
        }

        let internal_id: i64 = row.get(0)?;
        let fields_json: String = row.get(4)?;
        let fields: BTreeMap<String, String> = serde_json::from_str(&fields_json)
            .with_context(|| format!("invalid fields_json on contact {internal_id}"))?;

        out.push(PriorContact {
            internal_id,
            matching_id: row.get(1)?,
            key: NaturalKey::new(source_type, row.get::<_, String>(3)?),
            fields,
        });
    }

    Ok(out)
}

/// Sets `archived_date` on the active row for `key`. Returns false when no
/// active row exists, which is the already-archived case.
pub fn archive_active_row(connection: &Connection, key: &NaturalKey, archived_at: &str) -> Result<bool> {
    let changed = connection.execute(
        "
        UPDATE canonical_contacts
        SET archived_date = ?1
        WHERE source_type = ?2 AND source_id = ?3 AND archived_date IS NULL
        ",
        params![archived_at, key.source_type.as_str(), key.source_id],
    )?;
    Ok(changed > 0)
}

/// `matching_id` of the most recent row (active or archived) for `key`.
pub fn latest_matching_id(connection: &Connection, key: &NaturalKey) -> Result<Option<i64>> {
    let matching_id = connection
        .query_row(
            "
            SELECT matching_id
            FROM canonical_contacts
            WHERE source_type = ?1 AND source_id = ?2
            ORDER BY internal_id DESC
            LIMIT 1
            ",
            params![key.source_type.as_str(), key.source_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(matching_id)
}

/// Largest `matching_id` already handed out, counting manual overrides.
pub fn max_matching_id(connection: &Connection) -> Result<i64> {
    let max = connection.query_row(
        "
        SELECT MAX(
          COALESCE((SELECT MAX(matching_id) FROM canonical_contacts), 0),
          COALESCE((SELECT MAX(matching_id) FROM manual_matches), 0)
        )
        ",
        [],
        |row| row.get(0),
    )?;
    Ok(max)
}

#[derive(Debug, Clone)]
pub struct NewContact<'a> {
    pub matching_id: i64,
    pub record: &'a NormalizedRecord,
    pub contact: &'a ContactFields,
    pub created_date: &'a str,
    pub run_id: &'a str,
}

pub fn insert_contact(connection: &Connection, new: &NewContact<'_>) -> Result<i64> {
    let fields_json = serde_json::to_string(&new.record.fields)
        .context("failed to serialize contact fields")?;

    connection
        .execute(
            "
            INSERT INTO canonical_contacts(
              matching_id, source_type, source_id,
              first_name, last_name, email, mobile, street, apartment, city, state, zip,
              fields_json, json, created_date, archived_date, run_id
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, NULL, ?14, NULL, ?15)
            ",
            params![
                new.matching_id,
                new.record.source_type.as_str(),
                new.record.source_id,
                new.contact.first_name,
                new.contact.last_name,
                new.contact.email,
                new.contact.mobile,
                new.contact.street,
                new.contact.apartment,
                new.contact.city,
                new.contact.state,
                new.contact.zip,
                fields_json,
                new.created_date,
                new.run_id,
            ],
        )
        .with_context(|| {
            format!(
                "failed to insert contact {}/{}",
                new.record.source_type, new.record.source_id
            )
        })?;

    Ok(connection.last_insert_rowid())
}

/// Attaches raw payloads to the active row of each natural key. A row's
/// payload is written once, right after insert. Returns the rows written.
pub fn write_back_json(connection: &Connection, payloads: &[RawRowPayload]) -> Result<usize> {
    let mut statement = connection.prepare(
        "
        UPDATE canonical_contacts
        SET json = ?1
        WHERE source_type = ?2
          AND source_id = ?3
          AND archived_date IS NULL
          AND json IS NULL
        ",
    )?;

    let mut written = 0;
    for payload in payloads {
        let json = serde_json::to_string(&payload.json).context("failed to serialize raw row")?;
        written += statement.execute(params![
            json,
            payload.source_type.as_str(),
            payload.source_id
        ])?;
    }

    Ok(written)
}

/// Appends secondary-source rows, deduplicated by a hash of the canonical
/// fields so a re-delivered file inserts nothing even if its spreadsheet index
/// column shifted.
pub fn insert_source_rows(
    connection: &Connection,
    records: &[NormalizedRecord],
    payloads: &[RawRowPayload],
    created_date: &str,
    run_id: &str,
) -> Result<usize> {
    let mut statement = connection.prepare(
        "
        INSERT INTO source_rows(source_type, source_id, row_hash, fields_json, json, created_date, run_id)
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(row_hash) DO NOTHING
        ",
    )?;

    let mut inserted = 0;
    for (record, payload) in records.iter().zip(payloads) {
        let json = serde_json::to_string(&payload.json).context("failed to serialize raw row")?;
        let fields_json =
            serde_json::to_string(&record.fields).context("failed to serialize row fields")?;
        let row_hash =
            sha256_hex(format!("{}\u{1f}{fields_json}", record.source_type).as_bytes());

        inserted += statement.execute(params![
            record.source_type.as_str(),
            record.source_id,
            row_hash,
            fields_json,
            json,
            created_date,
            run_id,
        ])?;
    }

    Ok(inserted)
}

pub fn upsert_manual_matches(
    connection: &Connection,
    entries: &[(NaturalKey, i64)],
    run_id: &str,
) -> Result<usize> {
    let updated_at = now_utc_string();
    let mut statement = connection.prepare(
        "
        INSERT INTO manual_matches(source_type, source_id, matching_id, run_id, updated_at)
        VALUES(?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(source_type, source_id) DO UPDATE SET
          matching_id=excluded.matching_id,
          run_id=excluded.run_id,
          updated_at=excluded.updated_at
        WHERE manual_matches.matching_id != excluded.matching_id
        ",
    )?;

    let mut changed = 0;
    for (key, matching_id) in entries {
        changed += statement.execute(params![
            key.source_type.as_str(),
            key.source_id,
            matching_id,
            run_id,
            updated_at
        ])?;
    }

    Ok(changed)
}

pub fn load_manual_matches(connection: &Connection) -> Result<HashMap<NaturalKey, i64>> {
    let mut statement =
        connection.prepare("SELECT source_type, source_id, matching_id FROM manual_matches")?;
    let mut rows = statement.query([])?;

    let mut out = HashMap::new();
    while let Some(row) = rows.next()? {
        let source_type_raw: String = row.get(0)?;
        let Ok(source_type) = source_type_raw.parse::<SourceType>() else {
            continue;
        };
        out.insert(NaturalKey::new(source_type, row.get::<_, String>(1)?), row.get(2)?);
    }

    Ok(out)
}

/// An active contact as seen by identity matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCandidate {
    pub matching_id: i64,
    pub source_type: SourceType,
    pub contact: ContactFields,
}

pub fn load_identity_candidates(connection: &Connection) -> Result<Vec<IdentityCandidate>> {
    let mut statement = connection.prepare(
        "
        SELECT matching_id, source_type, first_name, last_name, email, mobile,
               street, apartment, city, state, zip
        FROM canonical_contacts
        WHERE archived_date IS NULL
        ORDER BY internal_id ASC
        ",
    )?;

    let mut rows = statement.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let source_type_raw: String = row.get(1)?;
        let Ok(source_type) = source_type_raw.parse::<SourceType>() else {
            continue;
        };

        out.push(IdentityCandidate {
            matching_id: row.get(0)?,
            source_type,
            contact: ContactFields {
                first_name: row.get(2)?,
                last_name: row.get(3)?,
                email: row.get(4)?,
                mobile: row.get(5)?,
                street: row.get(6)?,
                apartment: row.get(7)?,
                city: row.get(8)?,
                state: row.get(9)?,
                zip: row.get(10)?,
            },
        });
    }

    Ok(out)
}

pub fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}
