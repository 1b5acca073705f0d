use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// The two key spaces an account owns.
///
/// The ACI is the primary account identity; the PNI is the phone-number
/// identity. Each has its own identity key pair and its own pre-key stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Identity {
    Aci,
    Pni,
}

impl Identity {
    /// Both identities, ACI first.
    pub const ALL: [Identity; 2] = [Identity::Aci, Identity::Pni];

    /// Lowercase tag used for storage keys and the `identity` query parameter.
    pub fn as_str(self) -> &'static str {
        match self {
            Identity::Aci => "aci",
            Identity::Pni => "pni",
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Aci => f.write_str("ACI"),
            Identity::Pni => f.write_str("PNI"),
        }
    }
}

impl FromStr for Identity {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aci" => Ok(Identity::Aci),
            "pni" => Ok(Identity::Pni),
            other => Err(CryptoError::InvalidKey(format!("unknown identity: {other}"))),
        }
    }
}

/// A long-lived identity key pair.
///
/// Every pre-key issued under an [`Identity`] is signed with this key. It is
/// created once (registration, provisioning, or PNI creation) and reused.
#[derive(Clone, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore a key pair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Restore a key pair from stored secret and public halves, checking that
    /// they belong together.
    pub fn from_parts(secret: &[u8], public: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity secret wrong length".into()))?;
        let pair = Self::from_secret_bytes(&secret);
        if pair.public_key_bytes().as_slice() != public {
            return Err(CryptoError::InvalidKey(
                "identity public key does not match secret".into(),
            ));
        }
        Ok(pair)
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Secret key bytes, for persistence only.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify a detached signature made by the holder of `public_key`.
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| CryptoError::VerificationError(format!("invalid identity key: {e}")))?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::VerificationError(format!("malformed signature: {e}")))?;
        key.verify(message, &signature)
            .map_err(|e| CryptoError::VerificationError(e.to_string()))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }
}

impl PartialEq for IdentityKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.secret_key_bytes() == other.secret_key_bytes()
    }
}

impl Eq for IdentityKeyPair {}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let pair = IdentityKeyPair::generate();
        let message = b"signed pre-key public";

        let signature = pair.sign(message);
        assert!(
            IdentityKeyPair::verify(&pair.public_key_bytes(), message, &signature.to_bytes())
                .is_ok()
        );
        assert!(
            IdentityKeyPair::verify(&pair.public_key_bytes(), b"other", &signature.to_bytes())
                .is_err()
        );
    }

    #[test]
    fn from_parts_roundtrip() {
        let pair = IdentityKeyPair::generate();
        let restored =
            IdentityKeyPair::from_parts(pair.secret_key_bytes(), &pair.public_key_bytes())
                .unwrap();
        assert_eq!(pair, restored);
    }

    #[test]
    fn from_parts_rejects_mismatched_public_key() {
        let pair = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        assert!(
            IdentityKeyPair::from_parts(pair.secret_key_bytes(), &other.public_key_bytes())
                .is_err()
        );
    }

    #[test]
    fn debug_hides_secret() {
        let pair = IdentityKeyPair::generate();
        let rendered = format!("{pair:?}");
        assert!(rendered.contains(&pair.public_key_hex()));
        assert!(!rendered.contains(&hex::encode(pair.secret_key_bytes())));
    }

    #[test]
    fn identity_tags() {
        assert_eq!(Identity::Aci.as_str(), "aci");
        assert_eq!("PNI".parse::<Identity>().unwrap(), Identity::Pni);
        assert!("bogus".parse::<Identity>().is_err());
        assert_eq!(Identity::Pni.to_string(), "PNI");
    }
}
