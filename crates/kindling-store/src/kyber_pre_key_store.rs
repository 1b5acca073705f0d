use kindling_crypto::{Identity, KyberPreKeyRecord, Timestamp};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::db::{duration_millis, from_sql_timestamp, to_sql_timestamp};
use crate::error::StoreError;
use crate::metadata;
use crate::RetentionPolicy;

/// ML-KEM pre-keys for one identity. One-time and last-resort records share
/// a table and an id counter; at most one last-resort record is current.
#[derive(Debug, Clone, Copy)]
pub struct KyberPreKeyStore {
    identity: Identity,
}

type RawKyberPreKey = (u32, Vec<u8>, Vec<u8>, Vec<u8>, i64, bool);

fn raw_kyber_pre_key(row: &Row<'_>) -> rusqlite::Result<RawKyberPreKey> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode(
    (id, public_key, secret_key, signature, generated_at, is_last_resort): RawKyberPreKey,
) -> Result<KyberPreKeyRecord, StoreError> {
    Ok(KyberPreKeyRecord::from_parts(
        id,
        public_key,
        secret_key,
        signature,
        from_sql_timestamp(generated_at),
        is_last_resort,
    )?)
}

impl KyberPreKeyStore {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    fn scope(&self) -> &'static str {
        self.identity.as_str()
    }

    /// Reserve `count` consecutive ids and return the first.
    pub fn allocate_kyber_pre_key_ids(&self, tx: &Transaction<'_>, count: u32) -> Result<u32, StoreError> {
        metadata::allocate_ids(tx, self.scope(), metadata::NEXT_KYBER_PRE_KEY_ID, count)
    }

    /// Persist records of either kind; the kind comes from each record.
    pub fn store_kyber_pre_keys(
        &self,
        tx: &Transaction<'_>,
        records: &[KyberPreKeyRecord],
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let mut stmt = tx.prepare(
            "INSERT INTO kyber_pre_keys
                (identity, id, public_key, secret_key, signature, generated_at,
                 is_last_resort, created_at, used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
             ON CONFLICT(identity, id) DO UPDATE SET
                public_key = excluded.public_key,
                secret_key = excluded.secret_key,
                signature = excluded.signature,
                generated_at = excluded.generated_at,
                is_last_resort = excluded.is_last_resort,
                created_at = excluded.created_at,
                used = 0",
        )?;
        for record in records {
            stmt.execute(params![
                self.scope(),
                record.id(),
                record.public_key(),
                record.secret_key(),
                record.signature(),
                to_sql_timestamp(record.generated_at()),
                record.is_last_resort(),
                to_sql_timestamp(now),
            ])?;
        }
        Ok(())
    }

    /// Store a last-resort record and make it current, superseding the prior one.
    pub fn store_last_resort_pre_key_and_mark_as_current(
        &self,
        tx: &Transaction<'_>,
        record: &KyberPreKeyRecord,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        if !record.is_last_resort() {
            return Err(StoreError::Corrupt(format!(
                "kyber pre-key {} is not a last-resort key",
                record.id()
            )));
        }
        self.store_kyber_pre_keys(tx, std::slice::from_ref(record), now)?;
        metadata::set(
            tx,
            self.scope(),
            metadata::CURRENT_LAST_RESORT_KYBER_PRE_KEY_ID,
            i64::from(record.id()),
        )?;
        tracing::debug!(identity = %self.identity, id = record.id(), "last-resort kyber pre-key is now current");
        Ok(())
    }

    pub fn load_kyber_pre_key(
        &self,
        conn: &Connection,
        id: u32,
    ) -> Result<Option<KyberPreKeyRecord>, StoreError> {
        conn.query_row(
            "SELECT id, public_key, secret_key, signature, generated_at, is_last_resort
             FROM kyber_pre_keys WHERE identity = ?1 AND id = ?2",
            params![self.scope(), id],
            raw_kyber_pre_key,
        )
        .optional()?
        .map(decode)
        .transpose()
    }

    /// The current last-resort record, if any.
    pub fn last_resort_kyber_pre_key(
        &self,
        conn: &Connection,
    ) -> Result<Option<KyberPreKeyRecord>, StoreError> {
        match metadata::get_id(conn, self.scope(), metadata::CURRENT_LAST_RESORT_KYBER_PRE_KEY_ID)? {
            Some(id) => self.load_kyber_pre_key(conn, id),
            None => Ok(None),
        }
    }

    /// Ids of stored last-resort records, oldest first.
    pub fn last_resort_kyber_pre_key_ids(&self, conn: &Connection) -> Result<Vec<u32>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id FROM kyber_pre_keys
             WHERE identity = ?1 AND is_last_resort = 1 ORDER BY generated_at, id",
        )?;
        let ids = stmt
            .query_map(params![self.scope()], |row| row.get(0))?
            .collect::<Result<Vec<u32>, _>>()?;
        Ok(ids)
    }

    /// Number of one-time records not yet consumed.
    pub fn unused_one_time_kyber_pre_key_count(&self, conn: &Connection) -> Result<u32, StoreError> {
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM kyber_pre_keys
             WHERE identity = ?1 AND is_last_resort = 0 AND used = 0",
            params![self.scope()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Mark a one-time record consumed. Last-resort records stay reusable,
    /// so marking one is a no-op.
    pub fn mark_kyber_pre_key_used(&self, tx: &Transaction<'_>, id: u32) -> Result<(), StoreError> {
        tx.execute(
            "UPDATE kyber_pre_keys SET used = 1
             WHERE identity = ?1 AND id = ?2 AND is_last_resort = 0",
            params![self.scope(), id],
        )?;
        Ok(())
    }

    /// Delete a record. Removing the current last-resort record clears the pointer.
    pub fn remove_kyber_pre_key(&self, tx: &Transaction<'_>, id: u32) -> Result<(), StoreError> {
        tx.execute(
            "DELETE FROM kyber_pre_keys WHERE identity = ?1 AND id = ?2",
            params![self.scope(), id],
        )?;
        if metadata::get_id(tx, self.scope(), metadata::CURRENT_LAST_RESORT_KYBER_PRE_KEY_ID)?
            == Some(id)
        {
            metadata::delete(tx, self.scope(), metadata::CURRENT_LAST_RESORT_KYBER_PRE_KEY_ID)?;
        }
        Ok(())
    }

    /// Delete consumed one-time records and any stored before the retention window.
    pub fn cull_one_time_kyber_pre_keys(
        &self,
        tx: &Transaction<'_>,
        policy: &RetentionPolicy,
        now: Timestamp,
    ) -> Result<usize, StoreError> {
        let cutoff = now.saturating_sub(duration_millis(policy.one_time_retention));
        let removed = tx.execute(
            "DELETE FROM kyber_pre_keys
             WHERE identity = ?1 AND is_last_resort = 0 AND (used = 1 OR created_at < ?2)",
            params![self.scope(), to_sql_timestamp(cutoff)],
        )?;
        if removed > 0 {
            tracing::debug!(identity = %self.identity, removed, "culled one-time kyber pre-keys");
        }
        Ok(removed)
    }

    /// Same policy as signed pre-keys: never the current record, never the
    /// newest `min_retained_signed` prior ones, otherwise anything past the window.
    pub fn cull_last_resort_kyber_pre_keys(
        &self,
        tx: &Transaction<'_>,
        policy: &RetentionPolicy,
        now: Timestamp,
    ) -> Result<usize, StoreError> {
        let current =
            metadata::get_id(tx, self.scope(), metadata::CURRENT_LAST_RESORT_KYBER_PRE_KEY_ID)?;
        let cutoff = now.saturating_sub(duration_millis(policy.signed_retention));

        let mut stmt = tx.prepare(
            "SELECT id, generated_at FROM kyber_pre_keys
             WHERE identity = ?1 AND is_last_resort = 1
             ORDER BY generated_at DESC, id DESC",
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
                "DELETE FROM kyber_pre_keys WHERE identity = ?1 AND id = ?2",
                params![self.scope(), id],
            )?;
        }
        if !doomed.is_empty() {
            tracing::debug!(identity = %self.identity, removed = doomed.len(), "culled last-resort kyber pre-keys");
        }
        Ok(doomed.len())
    }

    pub fn last_successful_rotation(&self, conn: &Connection) -> Result<Option<Timestamp>, StoreError> {
        Ok(metadata::get(conn, self.scope(), metadata::KYBER_LAST_SUCCESSFUL_ROTATION)?
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
            metadata::KYBER_LAST_SUCCESSFUL_ROTATION,
            to_sql_timestamp(at),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::KeyDatabase;
    use kindling_crypto::prekeys::generate_kyber_pre_key_records;
    use kindling_crypto::IdentityKeyPair;

    const DAY: Timestamp = 24 * 60 * 60 * 1000;

    fn last_resort(db: &KeyDatabase, store: &KyberPreKeyStore, identity: &IdentityKeyPair, at: Timestamp) -> KyberPreKeyRecord {
        let id = db.write(|tx| store.allocate_kyber_pre_key_ids(tx, 1)).unwrap();
        KyberPreKeyRecord::generate(id, identity, at, true).unwrap()
    }

    #[test]
    fn last_resort_current_pointer() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let store = KyberPreKeyStore::new(Identity::Aci);
        let identity = IdentityKeyPair::generate();

        assert!(db.read(|c| store.last_resort_kyber_pre_key(c)).unwrap().is_none());

        let first = last_resort(&db, &store, &identity, 1);
        let second = last_resort(&db, &store, &identity, 2);
        db.write(|tx| store.store_last_resort_pre_key_and_mark_as_current(tx, &first, 1))
            .unwrap();
        db.write(|tx| store.store_last_resort_pre_key_and_mark_as_current(tx, &second, 2))
            .unwrap();

        assert_eq!(
            db.read(|c| store.last_resort_kyber_pre_key(c)).unwrap(),
            Some(second.clone())
        );
        assert_eq!(db.read(|c| store.last_resort_kyber_pre_key_ids(c)).unwrap().len(), 2);

        db.write(|tx| store.remove_kyber_pre_key(tx, second.id())).unwrap();
        assert!(db.read(|c| store.last_resort_kyber_pre_key(c)).unwrap().is_none());
    }

    #[test]
    fn one_time_record_cannot_become_current() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let store = KyberPreKeyStore::new(Identity::Pni);
        let identity = IdentityKeyPair::generate();
        let records = generate_kyber_pre_key_records(1, 1, &identity, 0).unwrap();

        let result = db.write(|tx| store.store_last_resort_pre_key_and_mark_as_current(tx, &records[0], 0));
        assert!(result.is_err());
    }

    #[test]
    fn marking_last_resort_used_is_a_no_op() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let store = KyberPreKeyStore::new(Identity::Aci);
        let identity = IdentityKeyPair::generate();

        let start = db.write(|tx| store.allocate_kyber_pre_key_ids(tx, 3)).unwrap();
        let one_time = generate_kyber_pre_key_records(start, 3, &identity, 0).unwrap();
        let resort = last_resort(&db, &store, &identity, 0);
        db.write(|tx| {
            store.store_kyber_pre_keys(tx, &one_time, 0)?;
            store.store_last_resort_pre_key_and_mark_as_current(tx, &resort, 0)
        })
        .unwrap();

        db.write(|tx| {
            store.mark_kyber_pre_key_used(tx, one_time[0].id())?;
            store.mark_kyber_pre_key_used(tx, resort.id())
        })
        .unwrap();
        assert_eq!(
            db.read(|c| store.unused_one_time_kyber_pre_key_count(c)).unwrap(),
            2
        );

        let removed = db
            .write(|tx| store.cull_one_time_kyber_pre_keys(tx, &RetentionPolicy::default(), 0))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.read(|c| store.last_resort_kyber_pre_key(c)).unwrap(), Some(resort));
    }

    #[test]
    fn cull_last_resort_keeps_current_and_recent() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let store = KyberPreKeyStore::new(Identity::Aci);
        let identity = IdentityKeyPair::generate();
        let now = 100 * DAY;

        for i in 0..5 {
            let rec = last_resort(&db, &store, &identity, i * DAY);
            db.write(|tx| store.store_kyber_pre_keys(tx, std::slice::from_ref(&rec), i * DAY))
                .unwrap();
        }
        let current = last_resort(&db, &store, &identity, now);
        db.write(|tx| store.store_last_resort_pre_key_and_mark_as_current(tx, &current, now))
            .unwrap();

        let removed = db
            .write(|tx| store.cull_last_resort_kyber_pre_keys(tx, &RetentionPolicy::default(), now))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(db.read(|c| store.last_resort_kyber_pre_key_ids(c)).unwrap().len(), 4);
        assert_eq!(db.read(|c| store.last_resort_kyber_pre_key(c)).unwrap(), Some(current));
    }
}
