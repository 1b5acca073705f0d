//! Scalar per-identity state: id counters, "current" pointers and health
//! fields. Everything is stored as an integer in `pre_key_metadata`.

use kindling_crypto::prekeys::{pre_key_id_after, random_pre_key_id};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::StoreError;

pub(crate) const NEXT_SIGNED_PRE_KEY_ID: &str = "next_signed_pre_key_id";
pub(crate) const NEXT_PRE_KEY_ID: &str = "next_pre_key_id";
pub(crate) const NEXT_KYBER_PRE_KEY_ID: &str = "next_kyber_pre_key_id";
pub(crate) const CURRENT_SIGNED_PRE_KEY_ID: &str = "current_signed_pre_key_id";
pub(crate) const CURRENT_LAST_RESORT_KYBER_PRE_KEY_ID: &str = "current_last_resort_kyber_pre_key_id";
pub(crate) const SIGNED_LAST_SUCCESSFUL_ROTATION: &str = "signed_last_successful_rotation";
pub(crate) const KYBER_LAST_SUCCESSFUL_ROTATION: &str = "kyber_last_successful_rotation";
pub(crate) const PRE_KEY_UPDATE_FAILURE_COUNT: &str = "pre_key_update_failure_count";
pub(crate) const FIRST_PRE_KEY_UPDATE_FAILURE: &str = "first_pre_key_update_failure";

pub fn get(conn: &Connection, scope: &str, key: &str) -> Result<Option<i64>, StoreError> {
    let value = conn
        .query_row(
            "SELECT value FROM pre_key_metadata WHERE scope = ?1 AND key = ?2",
            params![scope, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn set(tx: &Transaction<'_>, scope: &str, key: &str, value: i64) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO pre_key_metadata (scope, key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(scope, key) DO UPDATE SET value = excluded.value",
        params![scope, key, value],
    )?;
    Ok(())
}

pub fn delete(tx: &Transaction<'_>, scope: &str, key: &str) -> Result<(), StoreError> {
    tx.execute(
        "DELETE FROM pre_key_metadata WHERE scope = ?1 AND key = ?2",
        params![scope, key],
    )?;
    Ok(())
}

/// Reserve `count` consecutive ids from the counter under `key` and return
/// the first. The counter is seeded randomly the first time it is used.
pub(crate) fn allocate_ids(
    tx: &Transaction<'_>,
    scope: &str,
    key: &str,
    count: u32,
) -> Result<u32, StoreError> {
    let start = match get(tx, scope, key)? {
        Some(value) => u32::try_from(value)
            .map_err(|_| StoreError::Corrupt(format!("{scope}/{key} out of range: {value}")))?,
        None => random_pre_key_id(),
    };
    let next = pre_key_id_after(start, count);
    set(tx, scope, key, i64::from(next))?;
    Ok(start)
}

pub(crate) fn get_id(conn: &Connection, scope: &str, key: &str) -> Result<Option<u32>, StoreError> {
    get(conn, scope, key)?
        .map(|value| {
            u32::try_from(value)
                .map_err(|_| StoreError::Corrupt(format!("{scope}/{key} out of range: {value}")))
        })
        .transpose()
}
