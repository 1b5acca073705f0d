use std::path::Path;
use std::sync::Arc;

use kindling_crypto::Timestamp;
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};

use crate::error::StoreError;

/// Forward migrations. Entry `n` moves the schema from version `n` to
/// `n + 1`; append new entries, never edit applied ones.
const MIGRATIONS: &[&str] = &[SCHEMA_V1];

/// Schema version this build reads and writes.
const SCHEMA_VERSION: usize = MIGRATIONS.len();

/// Shared handle to the pre-key database.
///
/// Every mutation goes through [`KeyDatabase::write`], which hands the
/// closure an open transaction and commits only if the closure succeeds.
/// The stores themselves never open transactions, so a multi-kind bundle
/// persists atomically.
#[derive(Clone)]
pub struct KeyDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl KeyDatabase {
    /// Open (or create) the key database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut conn = Connection::open(path.as_ref())?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        migrate(&mut conn)?;
        tracing::debug!(path = %path.as_ref().display(), "key database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// An empty database that lives only as long as this handle.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection outside any explicit transaction.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a write transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }
}

/// Bring the schema up to [`SCHEMA_VERSION`] in one transaction.
///
/// Never drops tables: identity keys live here and must survive upgrades.
/// A database written by a newer build is refused rather than touched.
fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let found: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let found = usize::try_from(found)
        .map_err(|_| StoreError::Corrupt(format!("negative schema version {found}")))?;

    if found > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    if found == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (version, migration) in MIGRATIONS.iter().enumerate().skip(found) {
        tx.execute_batch(migration)?;
        tracing::info!(from = version, to = version + 1, "migrated key database schema");
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

pub(crate) fn to_sql_timestamp(ts: Timestamp) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_timestamp(value: i64) -> Timestamp {
    Timestamp::try_from(value).unwrap_or(0)
}

/// Milliseconds in `duration`, saturating.
pub(crate) fn duration_millis(duration: std::time::Duration) -> Timestamp {
    Timestamp::try_from(duration.as_millis()).unwrap_or(Timestamp::MAX)
}

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS identity_keys (
    identity TEXT PRIMARY KEY CHECK(identity IN ('aci','pni')),
    public_key BLOB NOT NULL,
    private_key BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS signed_pre_keys (
    identity TEXT NOT NULL,
    id INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    private_key BLOB NOT NULL,
    signature BLOB NOT NULL,
    generated_at INTEGER NOT NULL,
    accepted INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (identity, id)
);

CREATE TABLE IF NOT EXISTS one_time_pre_keys (
    identity TEXT NOT NULL,
    id INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    private_key BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    used INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (identity, id)
);

CREATE TABLE IF NOT EXISTS kyber_pre_keys (
    identity TEXT NOT NULL,
    id INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    secret_key BLOB NOT NULL,
    signature BLOB NOT NULL,
    generated_at INTEGER NOT NULL,
    is_last_resort INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    used INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (identity, id)
);

CREATE INDEX IF NOT EXISTS idx_kyber_pre_keys_kind
    ON kyber_pre_keys(identity, is_last_resort, generated_at);

CREATE TABLE IF NOT EXISTS pre_key_metadata (
    scope TEXT NOT NULL,
    key TEXT NOT NULL,
    value INTEGER NOT NULL,
    PRIMARY KEY (scope, key)
);
";
