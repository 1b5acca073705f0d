//! Durable per-identity storage for identity keys and pre-keys.
//!
//! All stores share one [`KeyDatabase`]. Mutating calls take the caller's
//! open transaction; reads take any connection.

use std::time::Duration;

pub mod db;
pub mod error;
pub mod identity_store;
pub mod kyber_pre_key_store;
pub mod metadata;
pub mod pre_key_store;
pub mod protocol_store;
pub mod signed_pre_key_store;

pub use db::KeyDatabase;
pub use error::StoreError;
pub use identity_store::IdentityKeyStore;
pub use kyber_pre_key_store::KyberPreKeyStore;
pub use pre_key_store::PreKeyStore;
pub use protocol_store::{ProtocolStore, ProtocolStoreManager};
pub use rusqlite::{Connection, Transaction};
pub use signed_pre_key_store::SignedPreKeyStore;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// How long superseded and one-time records are kept before culling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Age after which non-current signed and last-resort records may go.
    pub signed_retention: Duration,
    /// Prior signed / last-resort records always kept regardless of age.
    pub min_retained_signed: usize,
    /// Age after which unused one-time records are dropped.
    pub one_time_retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            signed_retention: DAY * 30,
            min_retained_signed: 3,
            one_time_retention: DAY * 90,
        }
    }
}
