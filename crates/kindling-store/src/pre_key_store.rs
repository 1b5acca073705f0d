use kindling_crypto::{Identity, PreKeyRecord, Timestamp};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::db::{duration_millis, to_sql_timestamp};
use crate::error::StoreError;
use crate::metadata;
use crate::RetentionPolicy;

/// One-time EC pre-keys for one identity.
#[derive(Debug, Clone, Copy)]
pub struct PreKeyStore {
    identity: Identity,
}

impl PreKeyStore {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    fn scope(&self) -> &'static str {
        self.identity.as_str()
    }

    /// Reserve `count` consecutive ids and return the first.
    pub fn allocate_pre_key_ids(&self, tx: &Transaction<'_>, count: u32) -> Result<u32, StoreError> {
        metadata::allocate_ids(tx, self.scope(), metadata::NEXT_PRE_KEY_ID, count)
    }

    pub fn store_pre_keys(
        &self,
        tx: &Transaction<'_>,
        records: &[PreKeyRecord],
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let mut stmt = tx.prepare(
            "INSERT INTO one_time_pre_keys (identity, id, public_key, private_key, created_at, used)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)
             ON CONFLICT(identity, id) DO UPDATE SET
                public_key = excluded.public_key,
                private_key = excluded.private_key,
                created_at = excluded.created_at,
                used = 0",
        )?;
        for record in records {
            stmt.execute(params![
                self.scope(),
                record.id(),
                record.public_key().as_slice(),
                record.private_key().as_slice(),
                to_sql_timestamp(now),
            ])?;
        }
        Ok(())
    }

    pub fn load_pre_key(&self, conn: &Connection, id: u32) -> Result<Option<PreKeyRecord>, StoreError> {
        let row: Option<(Vec<u8>, Vec<u8>)> = conn
            .query_row(
                "SELECT public_key, private_key FROM one_time_pre_keys
                 WHERE identity = ?1 AND id = ?2",
                params![self.scope(), id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(public, private)| PreKeyRecord::from_parts(id, &public, &private))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Number of stored records not yet consumed.
    pub fn unused_pre_key_count(&self, conn: &Connection) -> Result<u32, StoreError> {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM one_time_pre_keys WHERE identity = ?1 AND used = 0",
            params![self.scope()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Called by session establishment once a peer has consumed the key.
    pub fn mark_pre_key_used(&self, tx: &Transaction<'_>, id: u32) -> Result<(), StoreError> {
        tx.execute(
            "UPDATE one_time_pre_keys SET used = 1 WHERE identity = ?1 AND id = ?2",
            params![self.scope(), id],
        )?;
        Ok(())
    }

    pub fn remove_pre_key(&self, tx: &Transaction<'_>, id: u32) -> Result<(), StoreError> {
        tx.execute(
            "DELETE FROM one_time_pre_keys WHERE identity = ?1 AND id = ?2",
            params![self.scope(), id],
        )?;
        Ok(())
    }

    /// Delete consumed records and any stored before the retention window.
    pub fn cull_pre_keys(
        &self,
        tx: &Transaction<'_>,
        policy: &RetentionPolicy,
        now: Timestamp,
    ) -> Result<usize, StoreError> {
        let cutoff = now.saturating_sub(duration_millis(policy.one_time_retention));
        let removed = tx.execute(
            "DELETE FROM one_time_pre_keys
             WHERE identity = ?1 AND (used = 1 OR created_at < ?2)",
            params![self.scope(), to_sql_timestamp(cutoff)],
        )?;
        if removed > 0 {
            tracing::debug!(identity = %self.identity, removed, "culled one-time pre-keys");
        }
        Ok(removed)
    }
}
