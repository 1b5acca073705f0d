//! JSON bodies for the `/v2/keys` endpoints. Only public key material and
//! signatures are ever serialized.

use kindling_crypto::{KyberPreKeyRecord, PreKeyRecord, SignedPreKeyRecord};
use serde::{Deserialize, Serialize};

/// Remaining one-time keys the server holds for an identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyCounts {
    #[serde(rename = "count")]
    pub ec: u32,
    #[serde(rename = "pqCount", default)]
    pub pq: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyEntity {
    pub key_id: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKeyEntity {
    pub key_id: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// Same shape as [`SignedPreKeyEntity`]; the KEM public key is longer.
pub type KyberPreKeyEntity = SignedPreKeyEntity;

impl From<&PreKeyRecord> for PreKeyEntity {
    fn from(record: &PreKeyRecord) -> Self {
        Self {
            key_id: record.id(),
            public_key: record.public_key().to_vec(),
        }
    }
}

impl From<&SignedPreKeyRecord> for SignedPreKeyEntity {
    fn from(record: &SignedPreKeyRecord) -> Self {
        Self {
            key_id: record.id(),
            public_key: record.public_key().to_vec(),
            signature: record.signature().to_vec(),
        }
    }
}

impl From<&KyberPreKeyRecord> for SignedPreKeyEntity {
    fn from(record: &KyberPreKeyRecord) -> Self {
        Self {
            key_id: record.id(),
            public_key: record.public_key().to_vec(),
            signature: record.signature().to_vec(),
        }
    }
}

/// Body of `PUT /v2/keys`. Absent fields leave the server's keys of that
/// kind untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetKeysRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_pre_key: Option<SignedPreKeyEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_keys: Option<Vec<PreKeyEntity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pq_last_resort_pre_key: Option<KyberPreKeyEntity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pq_pre_keys: Option<Vec<KyberPreKeyEntity>>,
}

impl SetKeysRequest {
    /// True when there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.signed_pre_key.is_none()
            && self.pre_keys.as_ref().map_or(true, Vec::is_empty)
            && self.pq_last_resort_pre_key.is_none()
            && self.pq_pre_keys.as_ref().map_or(true, Vec::is_empty)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
