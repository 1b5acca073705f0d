use kindling_crypto::Identity;

use crate::identity_store::IdentityKeyStore;
use crate::kyber_pre_key_store::KyberPreKeyStore;
use crate::pre_key_store::PreKeyStore;
use crate::signed_pre_key_store::SignedPreKeyStore;

/// Every key store that belongs to one identity.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolStore {
    pub identity: Identity,
    pub identity_keys: IdentityKeyStore,
    pub signed_pre_keys: SignedPreKeyStore,
    pub pre_keys: PreKeyStore,
    pub kyber_pre_keys: KyberPreKeyStore,
}

impl ProtocolStore {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            identity_keys: IdentityKeyStore::new(identity),
            signed_pre_keys: SignedPreKeyStore::new(identity),
            pre_keys: PreKeyStore::new(identity),
            kyber_pre_keys: KyberPreKeyStore::new(identity),
        }
    }
}

/// The ACI and PNI store sets.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolStoreManager {
    aci: ProtocolStore,
    pni: ProtocolStore,
}

impl Default for ProtocolStoreManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolStoreManager {
    pub fn new() -> Self {
        Self {
            aci: ProtocolStore::new(Identity::Aci),
            pni: ProtocolStore::new(Identity::Pni),
        }
    }

    pub fn for_identity(&self, identity: Identity) -> &ProtocolStore {
        match identity {
            Identity::Aci => &self.aci,
            Identity::Pni => &self.pni,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::KeyDatabase;
    use kindling_crypto::IdentityKeyPair;

    #[test]
    fn identities_are_isolated() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let stores = ProtocolStoreManager::new();
        let aci = stores.for_identity(Identity::Aci);
        let pni = stores.for_identity(Identity::Pni);
        assert_eq!(pni.identity, Identity::Pni);

        let pair = IdentityKeyPair::generate();
        db.write(|tx| aci.identity_keys.store_identity_key_pair(tx, &pair))
            .unwrap();

        assert!(db.read(|c| aci.identity_keys.has_identity_key_pair(c)).unwrap());
        assert!(!db.read(|c| pni.identity_keys.has_identity_key_pair(c)).unwrap());
    }
}
