pub mod error;
pub mod identity;
pub mod prekeys;

pub use error::CryptoError;
pub use identity::{Identity, IdentityKeyPair};
pub use prekeys::{KyberPreKeyRecord, PreKeyRecord, SignedPreKeyRecord, Timestamp};
