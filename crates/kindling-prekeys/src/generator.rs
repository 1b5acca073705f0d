use std::sync::Arc;

use kindling_crypto::prekeys::{generate_kyber_pre_key_records, generate_pre_key_records};
use kindling_crypto::{Identity, IdentityKeyPair, KyberPreKeyRecord, SignedPreKeyRecord};
use kindling_store::{Connection, ProtocolStoreManager, Transaction};

use crate::bundle::{PartialPreKeyUploadBundle, RegistrationPreKeyUploadBundle};
use crate::context::Clock;
use crate::error::PreKeyError;
use crate::target::{PreKeyTarget, Targets};

/// Produces key material. Ids are reserved from the per-identity counters
/// inside the caller's transaction; records themselves are not stored here.
#[derive(Clone)]
pub struct KeyGenerator {
    stores: ProtocolStoreManager,
    clock: Arc<dyn Clock>,
    one_time_batch_size: u32,
    pq_one_time_batch_size: u32,
}

impl KeyGenerator {
    pub fn new(
        stores: ProtocolStoreManager,
        clock: Arc<dyn Clock>,
        one_time_batch_size: u32,
        pq_one_time_batch_size: u32,
    ) -> Self {
        Self {
            stores,
            clock,
            one_time_batch_size,
            pq_one_time_batch_size,
        }
    }

    /// The stored identity key pair, or a new one which is persisted before
    /// returning.
    pub fn get_or_create_identity_key_pair(
        &self,
        tx: &Transaction<'_>,
        identity: Identity,
    ) -> Result<IdentityKeyPair, PreKeyError> {
        let store = &self.stores.for_identity(identity).identity_keys;
        if let Some(existing) = store.identity_key_pair(tx)? {
            return Ok(existing);
        }
        let key_pair = IdentityKeyPair::generate();
        store.store_identity_key_pair(tx, &key_pair)?;
        tracing::info!(%identity, public_key = %key_pair.public_key_hex(), "created identity key pair");
        Ok(key_pair)
    }

    pub fn require_identity_key_pair(
        &self,
        conn: &Connection,
        identity: Identity,
    ) -> Result<IdentityKeyPair, PreKeyError> {
        self.stores
            .for_identity(identity)
            .identity_keys
            .identity_key_pair(conn)?
            .ok_or_else(|| {
                tracing::warn!(%identity, "cannot perform operation, missing identity key");
                PreKeyError::NoIdentityKey(identity)
            })
    }

    fn signed_pre_key(
        &self,
        tx: &Transaction<'_>,
        identity: Identity,
        identity_key_pair: &IdentityKeyPair,
    ) -> Result<SignedPreKeyRecord, PreKeyError> {
        let id = self
            .stores
            .for_identity(identity)
            .signed_pre_keys
            .allocate_signed_pre_key_id(tx)?;
        Ok(SignedPreKeyRecord::generate(id, identity_key_pair, self.clock.now()))
    }

    fn last_resort_pre_key(
        &self,
        tx: &Transaction<'_>,
        identity: Identity,
        identity_key_pair: &IdentityKeyPair,
    ) -> Result<KyberPreKeyRecord, PreKeyError> {
        let id = self
            .stores
            .for_identity(identity)
            .kyber_pre_keys
            .allocate_kyber_pre_key_ids(tx, 1)?;
        Ok(KyberPreKeyRecord::generate(
            id,
            identity_key_pair,
            self.clock.now(),
            true,
        )?)
    }

    /// Generate one batch or record per target. Fails as a whole if any
    /// generation fails.
    pub fn create_partial_bundle(
        &self,
        tx: &Transaction<'_>,
        identity: Identity,
        identity_key_pair: &IdentityKeyPair,
        targets: &Targets,
    ) -> Result<PartialPreKeyUploadBundle, PreKeyError> {
        let store = self.stores.for_identity(identity);
        let mut signed_pre_key = None;
        let mut pre_key_records = None;
        let mut last_resort_pre_key = None;
        let mut pq_pre_key_records = None;

        for target in targets.iter() {
            match target {
                PreKeyTarget::SignedPreKey => {
                    signed_pre_key = Some(self.signed_pre_key(tx, identity, identity_key_pair)?);
                }
                PreKeyTarget::OneTimePreKey => {
                    let start = store
                        .pre_keys
                        .allocate_pre_key_ids(tx, self.one_time_batch_size)?;
                    pre_key_records = Some(generate_pre_key_records(start, self.one_time_batch_size));
                }
                PreKeyTarget::OneTimePqPreKey => {
                    let start = store
                        .kyber_pre_keys
                        .allocate_kyber_pre_key_ids(tx, self.pq_one_time_batch_size)?;
                    pq_pre_key_records = Some(generate_kyber_pre_key_records(
                        start,
                        self.pq_one_time_batch_size,
                        identity_key_pair,
                        self.clock.now(),
                    )?);
                }
                PreKeyTarget::LastResortPqPreKey => {
                    last_resort_pre_key =
                        Some(self.last_resort_pre_key(tx, identity, identity_key_pair)?);
                }
            }
        }

        tracing::debug!(%identity, %targets, "generated partial bundle");
        Ok(PartialPreKeyUploadBundle::new(
            identity,
            signed_pre_key,
            pre_key_records,
            last_resort_pre_key,
            pq_pre_key_records,
        ))
    }

    /// Signed pre-key and last-resort key for registration or provisioning.
    pub fn create_registration_bundle(
        &self,
        tx: &Transaction<'_>,
        identity: Identity,
        identity_key_pair: IdentityKeyPair,
    ) -> Result<RegistrationPreKeyUploadBundle, PreKeyError> {
        let signed_pre_key = self.signed_pre_key(tx, identity, &identity_key_pair)?;
        let last_resort_pre_key = self.last_resort_pre_key(tx, identity, &identity_key_pair)?;
        Ok(RegistrationPreKeyUploadBundle::new(
            identity,
            identity_key_pair,
            signed_pre_key,
            last_resort_pre_key,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::PreKeyUploadBundle;
    use crate::context::ManualClock;
    use kindling_store::KeyDatabase;

    fn generator(batch: u32) -> KeyGenerator {
        KeyGenerator::new(
            ProtocolStoreManager::new(),
            Arc::new(ManualClock::new(42)),
            batch,
            batch,
        )
    }

    #[test]
    fn identity_key_is_created_once() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let generator = generator(5);

        let first = db
            .write(|tx| generator.get_or_create_identity_key_pair(tx, Identity::Aci))
            .unwrap();
        let second = db
            .write(|tx| generator.get_or_create_identity_key_pair(tx, Identity::Aci))
            .unwrap();
        assert_eq!(first.secret_key_bytes(), second.secret_key_bytes());
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());

        let required = db
            .read(|conn| generator.require_identity_key_pair(conn, Identity::Aci))
            .unwrap();
        assert_eq!(required, first);
    }

    #[test]
    fn missing_identity_key_is_an_error() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let err = db
            .read(|conn| generator(5).require_identity_key_pair(conn, Identity::Pni))
            .unwrap_err();
        assert!(matches!(err, PreKeyError::NoIdentityKey(Identity::Pni)));
    }

    #[test]
    fn partial_bundle_matches_targets() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let generator = generator(4);
        let identity_key_pair = IdentityKeyPair::generate();

        let bundle = db
            .write(|tx| {
                generator.create_partial_bundle(
                    tx,
                    Identity::Aci,
                    &identity_key_pair,
                    &Targets::from([PreKeyTarget::SignedPreKey, PreKeyTarget::OneTimePqPreKey]),
                )
            })
            .unwrap();

        let signed = bundle.signed_pre_key().unwrap();
        assert_eq!(signed.generated_at(), 42);
        assert!(signed
            .verify_signature(&identity_key_pair.public_key_bytes())
            .is_ok());
        assert_eq!(bundle.pq_pre_key_records().unwrap().len(), 4);
        assert!(bundle.pre_key_records().is_none());
        assert!(bundle.last_resort_pre_key().is_none());
    }

    #[test]
    fn empty_targets_generate_nothing() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let identity_key_pair = IdentityKeyPair::generate();
        let bundle = db
            .write(|tx| {
                generator(4).create_partial_bundle(tx, Identity::Pni, &identity_key_pair, &Targets::empty())
            })
            .unwrap();
        assert!(bundle.is_empty());
    }

    #[test]
    fn registration_bundle_ids_advance() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let generator = generator(4);
        let identity_key_pair = IdentityKeyPair::generate();

        let first = db
            .write(|tx| generator.create_registration_bundle(tx, Identity::Aci, identity_key_pair.clone()))
            .unwrap();
        let second = db
            .write(|tx| generator.create_registration_bundle(tx, Identity::Aci, identity_key_pair.clone()))
            .unwrap();

        assert_ne!(
            first.signed_pre_key_record().id(),
            second.signed_pre_key_record().id()
        );
        assert_ne!(
            first.last_resort_pre_key_record().id(),
            second.last_resort_pre_key_record().id()
        );
        assert!(first.last_resort_pre_key_record().is_last_resort());
    }
}
