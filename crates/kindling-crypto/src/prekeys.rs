//! Pre-key records and the primitives that generate them.
//!
//! Three kinds of record are issued under an identity key:
//! - signed pre-keys (X25519, signed by the identity key, rotated periodically)
//! - one-time pre-keys (X25519, consumed at most once)
//! - KEM pre-keys (ML-KEM-1024, signed by the identity key). A KEM record is
//!   either one-time or "last resort"; last-resort records may be reused.

use std::fmt;

use pqcrypto_mlkem::mlkem1024;
use pqcrypto_traits::kem::{PublicKey as _, SecretKey as _};
use rand::Rng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::identity::IdentityKeyPair;

/// Unix timestamp in milliseconds.
pub type Timestamp = u64;

/// Pre-key ids are 24-bit and never zero.
pub const MAX_PRE_KEY_ID: u32 = 0x00FF_FFFF;

/// The id `offset` steps after `start`, wrapping from [`MAX_PRE_KEY_ID`] to 1.
pub fn pre_key_id_after(start: u32, offset: u32) -> u32 {
    let zero_based = u64::from(start.max(1) - 1) + u64::from(offset);
    // Fits: the modulus is below u32::MAX.
    u32::try_from(zero_based % u64::from(MAX_PRE_KEY_ID)).unwrap_or(0) + 1
}

/// A random starting id for a fresh store.
pub fn random_pre_key_id() -> u32 {
    rand::rngs::OsRng.gen_range(1..=MAX_PRE_KEY_ID)
}

fn x25519_key_pair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = X25519Public::from(&secret);
    (*public.as_bytes(), secret.to_bytes())
}

fn to_key_array(bytes: &[u8], what: &str) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{what} wrong length")))
}

/// A medium-lived X25519 key signed by the identity key.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct SignedPreKeyRecord {
    #[zeroize(skip)]
    id: u32,
    #[zeroize(skip)]
    public_key: [u8; 32],
    private_key: [u8; 32],
    #[zeroize(skip)]
    signature: Vec<u8>,
    #[zeroize(skip)]
    generated_at: Timestamp,
}

impl SignedPreKeyRecord {
    /// Generate a fresh signed pre-key.
    pub fn generate(id: u32, identity_key_pair: &IdentityKeyPair, generated_at: Timestamp) -> Self {
        let (public_key, private_key) = x25519_key_pair();
        let signature = identity_key_pair.sign(&public_key).to_bytes().to_vec();
        Self {
            id,
            public_key,
            private_key,
            signature,
            generated_at,
        }
    }

    /// Rebuild a record loaded from storage.
    pub fn from_parts(
        id: u32,
        public_key: &[u8],
        private_key: &[u8],
        signature: Vec<u8>,
        generated_at: Timestamp,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            id,
            public_key: to_key_array(public_key, "signed pre-key public")?,
            private_key: to_key_array(private_key, "signed pre-key private")?,
            signature,
            generated_at,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn generated_at(&self) -> Timestamp {
        self.generated_at
    }

    /// Check the signature against the owning identity's public key.
    pub fn verify_signature(&self, identity_public: &[u8; 32]) -> Result<(), CryptoError> {
        IdentityKeyPair::verify(identity_public, &self.public_key, &self.signature)
    }
}

impl fmt::Debug for SignedPreKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedPreKeyRecord")
            .field("id", &self.id)
            .field("public_key", &hex::encode(self.public_key))
            .field("generated_at", &self.generated_at)
            .finish_non_exhaustive()
    }
}

/// A single-use X25519 pre-key.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct PreKeyRecord {
    #[zeroize(skip)]
    id: u32,
    #[zeroize(skip)]
    public_key: [u8; 32],
    private_key: [u8; 32],
}

impl PreKeyRecord {
    pub fn generate(id: u32) -> Self {
        let (public_key, private_key) = x25519_key_pair();
        Self {
            id,
            public_key,
            private_key,
        }
    }

    pub fn from_parts(id: u32, public_key: &[u8], private_key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            id,
            public_key: to_key_array(public_key, "pre-key public")?,
            private_key: to_key_array(private_key, "pre-key private")?,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }
}

impl fmt::Debug for PreKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreKeyRecord")
            .field("id", &self.id)
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Generate `count` one-time pre-keys with consecutive (wrapping) ids.
pub fn generate_pre_key_records(start_id: u32, count: u32) -> Vec<PreKeyRecord> {
    (0..count)
        .map(|offset| PreKeyRecord::generate(pre_key_id_after(start_id, offset)))
        .collect()
}

/// An ML-KEM-1024 pre-key signed by the identity key.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct KyberPreKeyRecord {
    #[zeroize(skip)]
    id: u32,
    #[zeroize(skip)]
    public_key: Vec<u8>,
    secret_key: Vec<u8>,
    #[zeroize(skip)]
    signature: Vec<u8>,
    #[zeroize(skip)]
    generated_at: Timestamp,
    #[zeroize(skip)]
    is_last_resort: bool,
}

impl KyberPreKeyRecord {
    /// Generate a KEM pre-key and sign its public key.
    pub fn generate(
        id: u32,
        identity_key_pair: &IdentityKeyPair,
        generated_at: Timestamp,
        is_last_resort: bool,
    ) -> Result<Self, CryptoError> {
        let (public, secret) = mlkem1024::keypair();
        let public_key = public.as_bytes().to_vec();
        if public_key.len() != mlkem1024::public_key_bytes() {
            return Err(CryptoError::KeyGeneration(
                "ML-KEM public key has unexpected length".into(),
            ));
        }
        let signature = identity_key_pair.sign(&public_key).to_bytes().to_vec();
        Ok(Self {
            id,
            public_key,
            secret_key: secret.as_bytes().to_vec(),
            signature,
            generated_at,
            is_last_resort,
        })
    }

    /// Rebuild a record loaded from storage, validating the key encodings.
    pub fn from_parts(
        id: u32,
        public_key: Vec<u8>,
        secret_key: Vec<u8>,
        signature: Vec<u8>,
        generated_at: Timestamp,
        is_last_resort: bool,
    ) -> Result<Self, CryptoError> {
        mlkem1024::PublicKey::from_bytes(&public_key)
            .map_err(|e| CryptoError::KemError(format!("invalid KEM public key: {e}")))?;
        mlkem1024::SecretKey::from_bytes(&secret_key)
            .map_err(|e| CryptoError::KemError(format!("invalid KEM secret key: {e}")))?;
        Ok(Self {
            id,
            public_key,
            secret_key,
            signature,
            generated_at,
            is_last_resort,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn secret_key(&self) -> &[u8] {
        &self.secret_key
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn generated_at(&self) -> Timestamp {
        self.generated_at
    }

    pub fn is_last_resort(&self) -> bool {
        self.is_last_resort
    }

    pub fn verify_signature(&self, identity_public: &[u8; 32]) -> Result<(), CryptoError> {
        IdentityKeyPair::verify(identity_public, &self.public_key, &self.signature)
    }
}

impl fmt::Debug for KyberPreKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KyberPreKeyRecord")
            .field("id", &self.id)
            .field("is_last_resort", &self.is_last_resort)
            .field("generated_at", &self.generated_at)
            .finish_non_exhaustive()
    }
}

/// Generate `count` one-time KEM pre-keys. Fails as a whole if any record fails.
pub fn generate_kyber_pre_key_records(
    start_id: u32,
    count: u32,
    identity_key_pair: &IdentityKeyPair,
    generated_at: Timestamp,
) -> Result<Vec<KyberPreKeyRecord>, CryptoError> {
    (0..count)
        .map(|offset| {
            KyberPreKeyRecord::generate(
                pre_key_id_after(start_id, offset),
                identity_key_pair,
                generated_at,
                false,
            )
        })
        .collect()
}
