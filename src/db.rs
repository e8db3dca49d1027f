use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use tracing::{info, warn};

use crate::address::{AddressComponents, AddressId, AddressRecord, AddressStatus, StatusChange};
use crate::errors::{AppError, AppResult, PersistenceConflict};
use crate::providers::ProviderId;
use crate::store::AddressStore;

const RECORD_COLUMNS: &str = "id, original_text, normalized_text, suggested_text, latitude, \
     longitude, postal_code, provider, confidence, status, failure, revision, created_at, \
     updated_at, history, street_info, neighborhood, apartment_info, notes";

/// SQLite-backed persistence collaborator.
#[derive(Clone)]
pub struct SqliteAddressStore {
    connection: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteAddressStore {
    pub fn open<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(database_file);
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let connection = Connection::open_with_flags(&db_path, flags)?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        run_migrations(&connection)?;
        info!(
            target: "database_bootstrap",
            path = %db_path.display(),
            "address store ready"
        );
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            path: Some(db_path),
        })
    }

    pub fn in_memory() -> AppResult<Self> {
        let connection = Connection::open_in_memory()?;
        run_migrations(&connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl AddressStore for SqliteAddressStore {
    fn load(&self, id: AddressId) -> AppResult<AddressRecord> {
        let conn = self.connection.lock();
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM addresses WHERE id = ?1"),
            [id.to_string()],
            parse_record,
        )
        .optional()?
        .ok_or(AppError::NotFound(id))?
    }

    fn save(&self, record: &AddressRecord) -> AppResult<AddressRecord> {
        let conn = self.connection.lock();
        let history = serde_json::to_string(&record.history)?;
        let changed = conn.execute(
            "UPDATE addresses SET
                normalized_text = ?3,
                suggested_text = ?4,
                latitude = ?5,
                longitude = ?6,
                postal_code = ?7,
                provider = ?8,
                confidence = ?9,
                status = ?10,
                failure = ?11,
                updated_at = ?12,
                history = ?13,
                street_info = ?14,
                neighborhood = ?15,
                apartment_info = ?16,
                notes = ?17,
                revision = revision + 1
            WHERE id = ?1 AND revision = ?2",
            params![
                record.id.to_string(),
                record.revision as i64,
                record.normalized_text,
                record.suggested_text,
                record.latitude,
                record.longitude,
                record.postal_code,
                record.provider.as_ref().map(ProviderId::as_str),
                record.confidence,
                record.status.as_str(),
                record.failure,
                record.updated_at.to_rfc3339(),
                history,
                record.components.street_info,
                record.components.neighborhood,
                record.components.apartment_info,
                record.components.notes,
            ],
        )?;

        if changed == 0 {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT revision FROM addresses WHERE id = ?1",
                    [record.id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            return match found {
                None => Err(AppError::NotFound(record.id)),
                Some(found) => {
                    warn!(id = %record.id, expected = record.revision, found, "rejecting stale address write");
                    Err(PersistenceConflict {
                        id: record.id,
                        expected: record.revision,
                        found: found as u64,
                    }
                    .into())
                }
            };
        }

        let mut saved = record.clone();
        saved.revision += 1;
        Ok(saved)
    }

    fn insert(&self, record: &AddressRecord) -> AppResult<()> {
        let conn = self.connection.lock();
        conn.execute(
            &format!(
                "INSERT INTO addresses ({RECORD_COLUMNS})
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19)"
            ),
            params![
                record.id.to_string(),
                record.original_text,
                record.normalized_text,
                record.suggested_text,
                record.latitude,
                record.longitude,
                record.postal_code,
                record.provider.as_ref().map(ProviderId::as_str),
                record.confidence,
                record.status.as_str(),
                record.failure,
                record.revision as i64,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
                serde_json::to_string(&record.history)?,
                record.components.street_info,
                record.components.neighborhood,
                record.components.apartment_info,
                record.components.notes,
            ],
        )?;
        Ok(())
    }

    fn find_by_original(&self, original_text: &str) -> AppResult<Option<AddressRecord>> {
        let conn = self.connection.lock();
        conn.query_row(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM addresses WHERE original_text = ?1
                ORDER BY seq ASC LIMIT 1"
            ),
            [original_text],
            parse_record,
        )
        .optional()?
        .transpose()
    }

    fn list(&self, status: Option<AddressStatus>) -> AppResult<Vec<AddressRecord>> {
        let conn = self.connection.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM addresses
            WHERE ?1 IS NULL OR status = ?1
            ORDER BY seq ASC"
        ))?;
        let rows = stmt
            .query_map([status.map(|s| s.as_str())], parse_record)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().collect()
    }
}

/// Column decoding happens inside rusqlite's row callback; domain parsing
/// errors are carried out as the inner `AppResult`.
fn parse_record(row: &Row<'_>) -> rusqlite::Result<AppResult<AddressRecord>> {
    let raw = StoredRow {
        id: row.get(0)?,
        original_text: row.get(1)?,
        normalized_text: row.get(2)?,
        suggested_text: row.get(3)?,
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        postal_code: row.get(6)?,
        provider: row.get(7)?,
        confidence: row.get(8)?,
        status: row.get(9)?,
        failure: row.get(10)?,
        revision: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        history: row.get(14)?,
        components: AddressComponents {
            street_info: row.get(15)?,
            neighborhood: row.get(16)?,
            apartment_info: row.get(17)?,
            notes: row.get(18)?,
        },
    };
    Ok(raw.into_record())
}

struct StoredRow {
    id: String,
    original_text: String,
    normalized_text: Option<String>,
    suggested_text: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    postal_code: Option<String>,
    provider: Option<String>,
    confidence: Option<f64>,
    status: String,
    failure: Option<String>,
    revision: i64,
    created_at: String,
    updated_at: String,
    history: String,
    components: AddressComponents,
}

impl StoredRow {
    fn into_record(self) -> AppResult<AddressRecord> {
        Ok(AddressRecord {
            id: AddressId::parse(&self.id)?,
            original_text: self.original_text,
            normalized_text: self.normalized_text,
            components: self.components,
            suggested_text: self.suggested_text,
            latitude: self.latitude,
            longitude: self.longitude,
            postal_code: self.postal_code,
            provider: self.provider.map(ProviderId::new),
            confidence: self.confidence,
            status: AddressStatus::parse(&self.status)?,
            failure: self.failure,
            revision: self.revision.max(0) as u64,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            history: serde_json::from_str::<Vec<StatusChange>>(&self.history)?,
        })
    }
}

fn parse_timestamp(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| AppError::Parse(format!("invalid timestamp {value:?}: {err}")))
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS addresses (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            original_text TEXT NOT NULL,
            normalized_text TEXT,
            suggested_text TEXT,
            latitude REAL,
            longitude REAL,
            postal_code TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'normalized', 'verified', 'failed')),
            revision INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_addresses_status ON addresses(status);
        CREATE INDEX IF NOT EXISTS idx_addresses_original ON addresses(original_text);
        "#,
    )?;

    ensure_column(connection, "addresses", "provider TEXT")?;
    ensure_column(connection, "addresses", "confidence REAL")?;
    ensure_column(connection, "addresses", "failure TEXT")?;
    ensure_column(connection, "addresses", "history TEXT NOT NULL DEFAULT '[]'")?;
    for column in ["street_info", "neighborhood", "apartment_info", "notes"] {
        ensure_column(connection, "addresses", &format!("{column} TEXT"))?;
    }
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
