use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use directory_core::{
    calendar_date, Address, AddressRow, ChildId, DirectoryError, DirectoryResult, Phone, PhoneRow,
    RecordHeader, RecordId, RecordStore, SearchKey,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
  id TEXT PRIMARY KEY,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  date_of_birth TEXT,
  gender TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (updated_at >= created_at)
);

CREATE TABLE IF NOT EXISTS addresses (
  id TEXT PRIMARY KEY,
  record_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  street TEXT NOT NULL,
  city TEXT NOT NULL,
  postal_code TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (updated_at >= created_at),
  FOREIGN KEY (record_id) REFERENCES records(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS phones (
  id TEXT PRIMARY KEY,
  record_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  number TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (updated_at >= created_at),
  FOREIGN KEY (record_id) REFERENCES records(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_addresses_record_id ON addresses(record_id);
CREATE INDEX IF NOT EXISTS idx_phones_record_id ON phones(record_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_records_name ON records(last_name, first_name);
CREATE INDEX IF NOT EXISTS idx_records_gender ON records(gender);
";

const HEADER_COLUMNS: &str =
    "r.id, r.first_name, r.last_name, r.date_of_birth, r.gender, r.created_at, r.updated_at";
const ADDRESS_COLUMNS: &str =
    "a.id, a.record_id, a.kind, a.street, a.city, a.postal_code, a.created_at, a.updated_at";
const PHONE_COLUMNS: &str = "p.id, p.record_id, p.kind, p.number, p.created_at, p.updated_at";
const KEY_FILTER: &str =
    "r.first_name = ?1 AND r.last_name = ?2 AND (?3 IS NULL OR r.gender = ?3)";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Fixture input for [`SqliteStore::bulk_load`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeedRecord {
    #[serde(default)]
    pub id: Option<RecordId>,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, with = "calendar_date::option")]
    pub date_of_birth: Option<Date>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub addresses: Vec<SeedAddress>,
    #[serde(default)]
    pub phones: Vec<SeedPhone>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeedAddress {
    #[serde(rename = "type")]
    pub kind: String,
    pub street: String,
    pub city: String,
    #[serde(default)]
    pub postal_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeedPhone {
    #[serde(rename = "type")]
    pub kind: String,
    pub number: String,
}

impl SqliteStore {
    /// Open a SQLite-backed directory store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer
    /// than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let before = current_schema_version(&self.conn)?;
        if before > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {before}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (version, sql) in [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)] {
            if version <= before {
                continue;
            }
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration {version}"))?;
            record_schema_version(&tx, version)?;
            tx.commit().with_context(|| format!("failed to commit migration {version}"))?;
            tracing::info!(version, "applied directory schema migration");
        }

        Ok(())
    }

    /// Insert seed records and their children in one transaction.
    ///
    /// Ids are generated unless the seed supplies one; timestamps are assigned here.
    ///
    /// # Errors
    /// Returns an error when a seed fails validation or any insert fails; nothing
    /// is written in that case.
    pub fn bulk_load(&mut self, seeds: &[SeedRecord]) -> Result<Vec<RecordId>> {
        let now = OffsetDateTime::now_utc();
        let stamp = rfc3339(now)?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let mut ids = Vec::with_capacity(seeds.len());

        for seed in seeds {
            let header = RecordHeader {
                id: seed.id.clone().unwrap_or_else(RecordId::generate),
                first_name: seed.first_name.clone(),
                last_name: seed.last_name.clone(),
                date_of_birth: seed.date_of_birth,
                gender: seed.gender.clone(),
                created_at: now,
                updated_at: now,
            };
            header.validate().map_err(|err| anyhow!("seed validation failed: {err}"))?;

            tx.execute(
                "INSERT INTO records(id, first_name, last_name, date_of_birth, gender, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    header.id.as_str(),
                    header.first_name,
                    header.last_name,
                    header.date_of_birth.map(calendar_date::format),
                    header.gender,
                    stamp,
                    stamp,
                ],
            )
            .with_context(|| format!("failed to insert record {}", header.id))?;

            for address in &seed.addresses {
                tx.execute(
                    "INSERT INTO addresses(id, record_id, kind, street, city, postal_code, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        ChildId::generate().as_str(),
                        header.id.as_str(),
                        address.kind,
                        address.street,
                        address.city,
                        address.postal_code,
                        stamp,
                        stamp,
                    ],
                )
                .with_context(|| format!("failed to insert address for {}", header.id))?;
            }

            for phone in &seed.phones {
                tx.execute(
                    "INSERT INTO phones(id, record_id, kind, number, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        ChildId::generate().as_str(),
                        header.id.as_str(),
                        phone.kind,
                        phone.number,
                        stamp,
                        stamp,
                    ],
                )
                .with_context(|| format!("failed to insert phone for {}", header.id))?;
            }

            ids.push(header.id);
        }

        tx.commit().context("failed to commit bulk load")?;
        tracing::info!(records = ids.len(), "bulk loaded directory records");
        Ok(ids)
    }

    fn load_header(&self, id: &RecordId) -> Result<Option<RecordHeader>> {
        let sql = format!("SELECT {HEADER_COLUMNS} FROM records r WHERE r.id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt.query_row(params![id.as_str()], RawHeader::read).optional()?;
        raw.map(RawHeader::decode).transpose()
    }

    fn load_address_rows(&self, key: &SearchKey) -> Result<Vec<AddressRow>> {
        let sql = format!(
            "SELECT {HEADER_COLUMNS}, {ADDRESS_COLUMNS}
             FROM addresses a JOIN records r ON r.id = a.record_id
             WHERE {KEY_FILTER}
             ORDER BY r.rowid ASC, a.rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![key.first_name, key.last_name, key.gender])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let parent = RawHeader::read(row)?.decode()?;
            let address = RawAddress::read(row, 7)?.decode()?;
            out.push(AddressRow { parent, address });
        }

        Ok(out)
    }

    fn load_phone_rows(&self, key: &SearchKey) -> Result<Vec<PhoneRow>> {
        let sql = format!(
            "SELECT {PHONE_COLUMNS}
             FROM phones p JOIN records r ON r.id = p.record_id
             WHERE {KEY_FILTER}
             ORDER BY r.rowid ASC, p.rowid ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![key.first_name, key.last_name, key.gender])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let phone = RawPhone::read(row, 0)?.decode()?;
            out.push(PhoneRow { parent_id: phone.record_id.clone(), phone });
        }

        Ok(out)
    }

    fn load_children(&self, id: &RecordId) -> Result<(Vec<Address>, Vec<Phone>)> {
        let address_sql = format!(
            "SELECT {ADDRESS_COLUMNS} FROM addresses a WHERE a.record_id = ?1 ORDER BY a.rowid ASC"
        );
        let mut stmt = self.conn.prepare(&address_sql)?;
        let mut rows = stmt.query(params![id.as_str()])?;
        let mut addresses = Vec::new();
        while let Some(row) = rows.next()? {
            addresses.push(RawAddress::read(row, 0)?.decode()?);
        }

        let phone_sql = format!(
            "SELECT {PHONE_COLUMNS} FROM phones p WHERE p.record_id = ?1 ORDER BY p.rowid ASC"
        );
        let mut stmt = self.conn.prepare(&phone_sql)?;
        let mut rows = stmt.query(params![id.as_str()])?;
        let mut phones = Vec::new();
        while let Some(row) = rows.next()? {
            phones.push(RawPhone::read(row, 0)?.decode()?);
        }

        Ok((addresses, phones))
    }
}

impl RecordStore for SqliteStore {
    fn find_by_id(&self, id: &RecordId) -> DirectoryResult<RecordHeader> {
        self.load_header(id)
            .map_err(store_error)?
            .ok_or_else(|| DirectoryError::NotFound(id.clone()))
    }

    fn find_address_rows_by_key(&self, key: &SearchKey) -> DirectoryResult<Vec<AddressRow>> {
        self.load_address_rows(key).map_err(store_error)
    }

    fn find_phone_rows_by_key(&self, key: &SearchKey) -> DirectoryResult<Vec<PhoneRow>> {
        self.load_phone_rows(key).map_err(store_error)
    }

    fn find_children_of(&self, id: &RecordId) -> DirectoryResult<(Vec<Address>, Vec<Phone>)> {
        self.load_children(id).map_err(store_error)
    }
}

/// Read a JSON array of [`SeedRecord`] from disk.
///
/// # Errors
/// Returns an error when the file cannot be read or is not a valid seed document.
pub fn read_seed_file(path: &Path) -> Result<Vec<SeedRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse seed file {}", path.display()))
}

struct RawHeader {
    id: String,
    first_name: String,
    last_name: String,
    date_of_birth: Option<String>,
    gender: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawHeader {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            date_of_birth: row.get(3)?,
            gender: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<RecordHeader> {
        Ok(RecordHeader {
            id: RecordId(self.id),
            first_name: self.first_name,
            last_name: self.last_name,
            date_of_birth: self
                .date_of_birth
                .map(|raw| calendar_date::parse(&raw).map_err(|err| anyhow!(err)))
                .transpose()?,
            gender: self.gender,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

struct RawAddress {
    id: String,
    record_id: String,
    kind: String,
    street: String,
    city: String,
    postal_code: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawAddress {
    fn read(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            record_id: row.get(offset + 1)?,
            kind: row.get(offset + 2)?,
            street: row.get(offset + 3)?,
            city: row.get(offset + 4)?,
            postal_code: row.get(offset + 5)?,
            created_at: row.get(offset + 6)?,
            updated_at: row.get(offset + 7)?,
        })
    }

    fn decode(self) -> Result<Address> {
        Ok(Address {
            id: ChildId(self.id),
            record_id: RecordId(self.record_id),
            kind: self.kind,
            street: self.street,
            city: self.city,
            postal_code: self.postal_code,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

struct RawPhone {
    id: String,
    record_id: String,
    kind: String,
    number: String,
    created_at: String,
    updated_at: String,
}

impl RawPhone {
    fn read(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            record_id: row.get(offset + 1)?,
            kind: row.get(offset + 2)?,
            number: row.get(offset + 3)?,
            created_at: row.get(offset + 4)?,
            updated_at: row.get(offset + 5)?,
        })
    }

    fn decode(self) -> Result<Phone> {
        Ok(Phone {
            id: ChildId(self.id),
            record_id: RecordId(self.record_id),
            kind: self.kind,
            number: self.number,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

#[allow(clippy::needless_pass_by_value)]
fn store_error(err: anyhow::Error) -> DirectoryError {
    tracing::error!(error = %format!("{err:#}"), "directory store query failed");
    DirectoryError::Store(format!("{err:#}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
