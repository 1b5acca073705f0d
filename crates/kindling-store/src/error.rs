use kindling_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("key database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion { found: usize, supported: usize },

    #[error("stored key material rejected: {0}")]
    Crypto(#[from] CryptoError),
}
