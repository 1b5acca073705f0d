use kindling_crypto::{Identity, IdentityKeyPair};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::StoreError;

/// Our own identity key pair for one [`Identity`].
#[derive(Debug, Clone, Copy)]
pub struct IdentityKeyStore {
    identity: Identity,
}

impl IdentityKeyStore {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn identity_key_pair(&self, conn: &Connection) -> Result<Option<IdentityKeyPair>, StoreError> {
        let row: Option<(Vec<u8>, Vec<u8>)> = conn
            .query_row(
                "SELECT private_key, public_key FROM identity_keys WHERE identity = ?1",
                params![self.identity.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(secret, public)| IdentityKeyPair::from_parts(&secret, &public))
            .transpose()
            .map_err(StoreError::from)
    }

    pub fn has_identity_key_pair(&self, conn: &Connection) -> Result<bool, StoreError> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM identity_keys WHERE identity = ?1)",
            params![self.identity.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Store (or replace) the identity key pair.
    pub fn store_identity_key_pair(
        &self,
        tx: &Transaction<'_>,
        key_pair: &IdentityKeyPair,
    ) -> Result<(), StoreError> {
        tx.execute(
            "INSERT INTO identity_keys (identity, public_key, private_key) VALUES (?1, ?2, ?3)
             ON CONFLICT(identity) DO UPDATE
             SET public_key = excluded.public_key, private_key = excluded.private_key",
            params![
                self.identity.as_str(),
                key_pair.public_key_bytes().as_slice(),
                key_pair.secret_key_bytes().as_slice(),
            ],
        )?;
        tracing::debug!(identity = %self.identity, public_key = %key_pair.public_key_hex(), "stored identity key pair");
        Ok(())
    }

    pub fn remove_identity_key_pair(&self, tx: &Transaction<'_>) -> Result<(), StoreError> {
        tx.execute(
            "DELETE FROM identity_keys WHERE identity = ?1",
            params![self.identity.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::KeyDatabase;

    #[test]
    fn store_and_load() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let aci = IdentityKeyStore::new(Identity::Aci);
        let pni = IdentityKeyStore::new(Identity::Pni);
        let pair = IdentityKeyPair::generate();

        assert!(db.read(|c| aci.identity_key_pair(c)).unwrap().is_none());
        db.write(|tx| aci.store_identity_key_pair(tx, &pair)).unwrap();

        assert_eq!(db.read(|c| aci.identity_key_pair(c)).unwrap(), Some(pair));
        assert!(db.read(|c| aci.has_identity_key_pair(c)).unwrap());
        assert!(!db.read(|c| pni.has_identity_key_pair(c)).unwrap());
    }

    #[test]
    fn replace_and_remove() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let store = IdentityKeyStore::new(Identity::Pni);
        let first = IdentityKeyPair::generate();
        let second = IdentityKeyPair::generate();

        db.write(|tx| store.store_identity_key_pair(tx, &first)).unwrap();
        db.write(|tx| store.store_identity_key_pair(tx, &second)).unwrap();
        assert_eq!(db.read(|c| store.identity_key_pair(c)).unwrap(), Some(second));

        db.write(|tx| store.remove_identity_key_pair(tx)).unwrap();
        assert!(db.read(|c| store.identity_key_pair(c)).unwrap().is_none());
    }
}
