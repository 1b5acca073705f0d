//! Chat service account endpoints used by the pre-key manager.

pub mod client;
pub mod entities;
pub mod error;

pub use client::{AccountServiceClient, ChatServiceAuth, HttpAccountServiceClient, ServiceCredentials};
pub use entities::{KyberPreKeyEntity, PreKeyCounts, PreKeyEntity, SetKeysRequest, SignedPreKeyEntity};
pub use error::ServiceError;
