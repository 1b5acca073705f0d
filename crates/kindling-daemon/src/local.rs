//! Collaborators for running without a client around the key database.

use kindling_crypto::Identity;
use kindling_prekeys::{AccountState, AppLifecycle};
use kindling_store::{KeyDatabase, ProtocolStoreManager};

/// Registration state read from the key database: an identity counts as
/// present once its identity key has been stored.
pub struct StoredAccountState {
    db: KeyDatabase,
    stores: ProtocolStoreManager,
}

impl StoredAccountState {
    pub fn new(db: KeyDatabase) -> Self {
        Self {
            db,
            stores: ProtocolStoreManager::new(),
        }
    }

    fn has_identity_key(&self, identity: Identity) -> bool {
        let store = &self.stores.for_identity(identity).identity_keys;
        match self.db.read(|conn| store.has_identity_key_pair(conn)) {
            Ok(present) => present,
            Err(e) => {
                tracing::warn!(%identity, error = %e, "failed to read identity key");
                false
            }
        }
    }
}

impl AccountState for StoredAccountState {
    fn is_registered(&self) -> bool {
        self.has_identity_key(Identity::Aci)
    }

    fn has_pni(&self) -> bool {
        self.has_identity_key(Identity::Pni)
    }
}

/// The daemon is always the foreground process.
pub struct Headless;

impl AppLifecycle for Headless {
    fn is_main_app_and_active(&self) -> bool {
        true
    }
}
