use kindling_crypto::{Identity, SignedPreKeyRecord, Timestamp};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::db::{duration_millis, from_sql_timestamp, to_sql_timestamp};
use crate::error::StoreError;
use crate::metadata;
use crate::RetentionPolicy;

/// Signed pre-keys for one identity, plus the health fields that drive the
/// app-lock policy (last successful rotation, failure streak).
#[derive(Debug, Clone, Copy)]
pub struct SignedPreKeyStore {
    identity: Identity,
}

type RawSignedPreKey = (u32, Vec<u8>, Vec<u8>, Vec<u8>, i64);

fn raw_signed_pre_key(row: &Row<'_>) -> rusqlite::Result<RawSignedPreKey> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode((id, public_key, private_key, signature, generated_at): RawSignedPreKey) -> Result<SignedPreKeyRecord, StoreError> {
    Ok(SignedPreKeyRecord::from_parts(
        id,
        &public_key,
        &private_key,
        signature,
        from_sql_timestamp(generated_at),
    )?)
}

impl SignedPreKeyStore {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    fn scope(&self) -> &'static str {
        self.identity.as_str()
    }

    /// Reserve the id for the next signed pre-key.
    pub fn allocate_signed_pre_key_id(&self, tx: &Transaction<'_>) -> Result<u32, StoreError> {
        metadata::allocate_ids(tx, self.scope(), metadata::NEXT_SIGNED_PRE_KEY_ID, 1)
    }

    /// Persist a record without marking it accepted. Storing the same id
    /// twice overwrites it.
    pub fn store_signed_pre_key(
        &self,
        tx: &Transaction<'_>,
        record: &SignedPreKeyRecord,
    ) -> Result<(), StoreError> {
        self.insert(tx, record, false)
    }

    fn insert(&self, tx: &Transaction<'_>, record: &SignedPreKeyRecord, accepted: bool) -> Result<(), StoreError> {
        tx.execute(
            "INSERT INTO signed_pre_keys
                (identity, id, public_key, private_key, signature, generated_at, accepted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(identity, id) DO UPDATE SET
                public_key = excluded.public_key,
                private_key = excluded.private_key,
                signature = excluded.signature,
                generated_at = excluded.generated_at,
                accepted = MAX(accepted, excluded.accepted)",
            params![
                self.scope(),
                record.id(),
                record.public_key().as_slice(),
                record.private_key().as_slice(),
                record.signature(),
                to_sql_timestamp(record.generated_at()),
                accepted,
            ],
        )?;
        Ok(())
    }

    pub fn load_signed_pre_key(
        &self,
        conn: &Connection,
        id: u32,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        conn.query_row(
            "SELECT id, public_key, private_key, signature, generated_at
             FROM signed_pre_keys WHERE identity = ?1 AND id = ?2",
            params![self.scope(), id],
            raw_signed_pre_key,
        )
        .optional()?
        .map(decode)
        .transpose()
    }

    /// Ids of every stored signed pre-key, oldest first.
    pub fn signed_pre_key_ids(&self, conn: &Connection) -> Result<Vec<u32>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id FROM signed_pre_keys WHERE identity = ?1 ORDER BY generated_at, id",
        )?;
        let ids = stmt
            .query_map(params![self.scope()], |row| row.get(0))?
            .collect::<Result<Vec<u32>, _>>()?;
        Ok(ids)
    }

    /// The record the server most recently accepted, if any.
    pub fn current_signed_pre_key(
        &self,
        conn: &Connection,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        match metadata::get_id(conn, self.scope(), metadata::CURRENT_SIGNED_PRE_KEY_ID)? {
            Some(id) => self.load_signed_pre_key(conn, id),
            None => Ok(None),
        }
    }

    /// Store `record`, mark it accepted and make it the current signed
    /// pre-key. Clears any pre-key update failure streak.
    pub fn store_signed_pre_key_as_accepted_and_current(
        &self,
        tx: &Transaction<'_>,
        record: &SignedPreKeyRecord,
    ) -> Result<(), StoreError> {
        self.insert(tx, record, true)?;
        metadata::set(
            tx,
            self.scope(),
            metadata::CURRENT_SIGNED_PRE_KEY_ID,
            i64::from(record.id()),
        )?;
        self.clear_pre_key_update_failures(tx)?;
        tracing::debug!(identity = %self.identity, id = record.id(), "signed pre-key is now current");
        Ok(())
    }

    /// Delete a record. Removing the current record also clears the pointer.
    pub fn remove_signed_pre_key(&self, tx: &Transaction<'_>, id: u32) -> Result<(), StoreError> {
        tx.execute(
            "DELETE FROM signed_pre_keys WHERE identity = ?1 AND id = ?2",
            params![self.scope(), id],
        )?;
        if metadata::get_id(tx, self.scope(), metadata::CURRENT_SIGNED_PRE_KEY_ID)? == Some(id) {
            metadata::delete(tx, self.scope(), metadata::CURRENT_SIGNED_PRE_KEY_ID)?;
        }
        Ok(())
    }

    /// Delete non-current records older than the retention window, keeping
    /// at least `min_retained_signed` of the newest prior records.
    pub fn cull_signed_pre_keys(
        &self,
        tx: &Transaction<'_>,
        policy: &RetentionPolicy,
        now: Timestamp,
    ) -> Result<usize, StoreError> {
        let current = metadata::get_id(tx, self.scope(), metadata::CURRENT_SIGNED_PRE_KEY_ID)?;
        let cutoff = now.saturating_sub(duration_millis(policy.signed_retention));

        let mut stmt = tx.prepare(
            "SELECT id, generated_at FROM signed_pre_keys
             WHERE identity = ?1 ORDER BY generated_at DESC, id DESC",
        )?;
        let candidates: Vec<(u32, i64)> = stmt
            .query_map(params![self.scope()], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        let doomed: Vec<u32> = candidates
            .into_iter()
            .filter(|(id, _)| Some(*id) != current)
            .skip(policy.min_retained_signed)
            .filter(|(_, generated_at)| from_sql_timestamp(*generated_at) < cutoff)
            .map(|(id, _)| id)
            .collect();

        for id in &doomed {
            tx.execute(
                "DELETE FROM signed_pre_keys WHERE identity = ?1 AND id = ?2",
                params![self.scope(), id],
            )?;
        }
        if !doomed.is_empty() {
            tracing::debug!(identity = %self.identity, removed = doomed.len(), "culled signed pre-keys");
        }
        Ok(doomed.len())
    }

    pub fn last_successful_rotation(&self, conn: &Connection) -> Result<Option<Timestamp>, StoreError> {
        Ok(metadata::get(conn, self.scope(), metadata::SIGNED_LAST_SUCCESSFUL_ROTATION)?
            .map(from_sql_timestamp))
    }

    pub fn set_last_successful_rotation(
        &self,
        tx: &Transaction<'_>,
        at: Timestamp,
    ) -> Result<(), StoreError> {
        metadata::set(
            tx,
            self.scope(),
            metadata::SIGNED_LAST_SUCCESSFUL_ROTATION,
            to_sql_timestamp(at),
        )
    }

    pub fn pre_key_update_failure_count(&self, conn: &Connection) -> Result<u32, StoreError> {
        let count = metadata::get(conn, self.scope(), metadata::PRE_KEY_UPDATE_FAILURE_COUNT)?
            .unwrap_or(0);
        Ok(u32::try_from(count).unwrap_or(0))
    }

    pub fn first_pre_key_update_failure(&self, conn: &Connection) -> Result<Option<Timestamp>, StoreError> {
        Ok(metadata::get(conn, self.scope(), metadata::FIRST_PRE_KEY_UPDATE_FAILURE)?
            .map(from_sql_timestamp))
    }

    /// Count one more failed update. The first failure of a streak records
    /// its date. Returns the new count.
    pub fn increment_pre_key_update_failure_count(
        &self,
        tx: &Transaction<'_>,
        now: Timestamp,
    ) -> Result<u32, StoreError> {
        let count = self.pre_key_update_failure_count(tx)?.saturating_add(1);
        metadata::set(
            tx,
            self.scope(),
            metadata::PRE_KEY_UPDATE_FAILURE_COUNT,
            i64::from(count),
        )?;
        if self.first_pre_key_update_failure(tx)?.is_none() {
            metadata::set(
                tx,
                self.scope(),
                metadata::FIRST_PRE_KEY_UPDATE_FAILURE,
                to_sql_timestamp(now),
            )?;
        }
        Ok(count)
    }

    pub fn clear_pre_key_update_failures(&self, tx: &Transaction<'_>) -> Result<(), StoreError> {
        metadata::delete(tx, self.scope(), metadata::PRE_KEY_UPDATE_FAILURE_COUNT)?;
        metadata::delete(tx, self.scope(), metadata::FIRST_PRE_KEY_UPDATE_FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::KeyDatabase;
    use kindling_crypto::IdentityKeyPair;

    const DAY: Timestamp = 24 * 60 * 60 * 1000;

    fn record(store: &SignedPreKeyStore, db: &KeyDatabase, at: Timestamp) -> SignedPreKeyRecord {
        let identity = IdentityKeyPair::generate();
        let id = db.write(|tx| store.allocate_signed_pre_key_id(tx)).unwrap();
        SignedPreKeyRecord::generate(id, &identity, at)
    }

    #[test]
    fn accepted_record_becomes_current() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let store = SignedPreKeyStore::new(Identity::Aci);
        let first = record(&store, &db, 1);
        let second = record(&store, &db, 2);

        db.write(|tx| store.store_signed_pre_key(tx, &first)).unwrap();
        assert!(db.read(|c| store.current_signed_pre_key(c)).unwrap().is_none());

        db.write(|tx| store.store_signed_pre_key_as_accepted_and_current(tx, &first))
            .unwrap();
        db.write(|tx| store.store_signed_pre_key_as_accepted_and_current(tx, &second))
            .unwrap();

        assert_eq!(
            db.read(|c| store.current_signed_pre_key(c)).unwrap(),
            Some(second.clone())
        );
        assert_eq!(
            db.read(|c| store.load_signed_pre_key(c, first.id())).unwrap(),
            Some(first)
        );

        let pni = SignedPreKeyStore::new(Identity::Pni);
        assert!(db.read(|c| pni.current_signed_pre_key(c)).unwrap().is_none());
    }

    #[test]
    fn removing_current_clears_pointer() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let store = SignedPreKeyStore::new(Identity::Pni);
        let rec = record(&store, &db, 5);

        db.write(|tx| store.store_signed_pre_key_as_accepted_and_current(tx, &rec))
            .unwrap();
        db.write(|tx| store.remove_signed_pre_key(tx, rec.id())).unwrap();

        assert!(db.read(|c| store.current_signed_pre_key(c)).unwrap().is_none());
        assert!(db.read(|c| store.signed_pre_key_ids(c)).unwrap().is_empty());
    }

    #[test]
    fn cull_keeps_current_and_recent() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let store = SignedPreKeyStore::new(Identity::Aci);
        let policy = RetentionPolicy::default();
        let now = 100 * DAY;

        // Six old records, then a current one.
        let old: Vec<_> = (0..6).map(|i| record(&store, &db, i * DAY)).collect();
        for rec in &old {
            db.write(|tx| store.store_signed_pre_key(tx, rec)).unwrap();
        }
        let current = record(&store, &db, now);
        db.write(|tx| store.store_signed_pre_key_as_accepted_and_current(tx, &current))
            .unwrap();

        let removed = db
            .write(|tx| store.cull_signed_pre_keys(tx, &policy, now))
            .unwrap();
        assert_eq!(removed, 3);

        let mut remaining = db.read(|c| store.signed_pre_key_ids(c)).unwrap();
        remaining.sort_unstable();
        let mut expected: Vec<u32> = old[3..].iter().map(SignedPreKeyRecord::id).collect();
        expected.push(current.id());
        expected.sort_unstable();
        assert_eq!(remaining, expected);
    }

    #[test]
    fn cull_spares_records_inside_window() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let store = SignedPreKeyStore::new(Identity::Aci);
        let now = 100 * DAY;

        for i in 0..5 {
            let rec = record(&store, &db, now - i * DAY);
            db.write(|tx| store.store_signed_pre_key(tx, &rec)).unwrap();
        }
        let removed = db
            .write(|tx| store.cull_signed_pre_keys(tx, &RetentionPolicy::default(), now))
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn failure_streak_tracking() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let store = SignedPreKeyStore::new(Identity::Aci);

        assert_eq!(db.read(|c| store.pre_key_update_failure_count(c)).unwrap(), 0);
        assert_eq!(
            db.write(|tx| store.increment_pre_key_update_failure_count(tx, 10))
                .unwrap(),
            1
        );
        assert_eq!(
            db.write(|tx| store.increment_pre_key_update_failure_count(tx, 20))
                .unwrap(),
            2
        );
        assert_eq!(db.read(|c| store.first_pre_key_update_failure(c)).unwrap(), Some(10));

        let rec = record(&store, &db, 30);
        db.write(|tx| store.store_signed_pre_key_as_accepted_and_current(tx, &rec))
            .unwrap();
        assert_eq!(db.read(|c| store.pre_key_update_failure_count(c)).unwrap(), 0);
        assert_eq!(db.read(|c| store.first_pre_key_update_failure(c)).unwrap(), None);
    }

    #[test]
    fn rotation_date_roundtrip() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let store = SignedPreKeyStore::new(Identity::Pni);
        assert_eq!(db.read(|c| store.last_successful_rotation(c)).unwrap(), None);
        db.write(|tx| store.set_last_successful_rotation(tx, 1234)).unwrap();
        assert_eq!(db.read(|c| store.last_successful_rotation(c)).unwrap(), Some(1234));
    }
}
