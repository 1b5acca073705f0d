use kindling_crypto::{CryptoError, Identity};
use kindling_service::ServiceError;
use kindling_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreKeyError {
    #[error("no identity key for {0}")]
    NoIdentityKey(Identity),

    #[error("pre-key task cancelled")]
    Cancelled,

    #[error("message processing failed: {0}")]
    MessageProcessingFailed(String),

    #[error("server rejected the {0} identity key")]
    IdentityKeyMismatch(Identity),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("pre-key manager has shut down")]
    ShutDown,
}

impl PreKeyError {
    /// Whether a failed signed pre-key update should extend the failure
    /// streak that drives the app lock. Transient and expected conditions
    /// do not count.
    pub fn counts_as_update_failure(&self) -> bool {
        match self {
            PreKeyError::Service(e) => !e.is_network_failure(),
            PreKeyError::NoIdentityKey(_)
            | PreKeyError::Cancelled
            | PreKeyError::ShutDown => false,
            PreKeyError::MessageProcessingFailed(_)
            | PreKeyError::IdentityKeyMismatch(_)
            | PreKeyError::Storage(_)
            | PreKeyError::Crypto(_) => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    FileReadError(String),

    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    #[error("invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("configuration validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_streak_classification() {
        let rejected = PreKeyError::Service(ServiceError::Http {
            status: 422,
            message: "bad signature".into(),
        });
        assert!(rejected.counts_as_update_failure());

        let offline = PreKeyError::Service(ServiceError::Network("timeout".into()));
        assert!(!offline.counts_as_update_failure());

        assert!(!PreKeyError::Cancelled.counts_as_update_failure());
        assert!(!PreKeyError::NoIdentityKey(Identity::Pni).counts_as_update_failure());
        assert!(PreKeyError::Storage(StoreError::Corrupt("x".into())).counts_as_update_failure());
    }
}
