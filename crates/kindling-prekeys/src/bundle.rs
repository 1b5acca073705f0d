//! Freshly generated key material for one task, pending upload and
//! persistence. Bundles are built once and only read afterwards.

use kindling_crypto::{Identity, IdentityKeyPair, KyberPreKeyRecord, PreKeyRecord, SignedPreKeyRecord};
use kindling_service::{KyberPreKeyEntity, PreKeyEntity, SetKeysRequest};

/// Read-only view shared by the partial and registration bundle shapes.
pub trait PreKeyUploadBundle: Send + Sync {
    fn identity(&self) -> Identity;
    fn signed_pre_key(&self) -> Option<&SignedPreKeyRecord>;
    fn pre_key_records(&self) -> Option<&[PreKeyRecord]>;
    fn last_resort_pre_key(&self) -> Option<&KyberPreKeyRecord>;
    fn pq_pre_key_records(&self) -> Option<&[KyberPreKeyRecord]>;

    fn is_empty(&self) -> bool {
        self.signed_pre_key().is_none()
            && self.pre_key_records().map_or(true, <[_]>::is_empty)
            && self.last_resort_pre_key().is_none()
            && self.pq_pre_key_records().map_or(true, <[_]>::is_empty)
    }

    /// The upload body: public halves and signatures only.
    fn to_request(&self) -> SetKeysRequest {
        SetKeysRequest {
            signed_pre_key: self.signed_pre_key().map(Into::into),
            pre_keys: self
                .pre_key_records()
                .map(|records| records.iter().map(PreKeyEntity::from).collect()),
            pq_last_resort_pre_key: self.last_resort_pre_key().map(Into::into),
            pq_pre_keys: self
                .pq_pre_key_records()
                .map(|records| records.iter().map(KyberPreKeyEntity::from).collect()),
        }
    }
}

/// Any subset of the four kinds. Used by refresh, rotate and one-time creation.
#[derive(Debug, Clone)]
pub struct PartialPreKeyUploadBundle {
    identity: Identity,
    signed_pre_key: Option<SignedPreKeyRecord>,
    pre_key_records: Option<Vec<PreKeyRecord>>,
    last_resort_pre_key: Option<KyberPreKeyRecord>,
    pq_pre_key_records: Option<Vec<KyberPreKeyRecord>>,
}

impl PartialPreKeyUploadBundle {
    pub fn new(
        identity: Identity,
        signed_pre_key: Option<SignedPreKeyRecord>,
        pre_key_records: Option<Vec<PreKeyRecord>>,
        last_resort_pre_key: Option<KyberPreKeyRecord>,
        pq_pre_key_records: Option<Vec<KyberPreKeyRecord>>,
    ) -> Self {
        Self {
            identity,
            signed_pre_key,
            pre_key_records,
            last_resort_pre_key,
            pq_pre_key_records,
        }
    }

    pub fn empty(identity: Identity) -> Self {
        Self::new(identity, None, None, None, None)
    }
}

impl PreKeyUploadBundle for PartialPreKeyUploadBundle {
    fn identity(&self) -> Identity {
        self.identity
    }

    fn signed_pre_key(&self) -> Option<&SignedPreKeyRecord> {
        self.signed_pre_key.as_ref()
    }

    fn pre_key_records(&self) -> Option<&[PreKeyRecord]> {
        self.pre_key_records.as_deref()
    }

    fn last_resort_pre_key(&self) -> Option<&KyberPreKeyRecord> {
        self.last_resort_pre_key.as_ref()
    }

    fn pq_pre_key_records(&self) -> Option<&[KyberPreKeyRecord]> {
        self.pq_pre_key_records.as_deref()
    }
}

/// Identity key pair, signed pre-key and last-resort key for one identity,
/// produced at registration or provisioning. The caller uploads it through
/// the registration request and reports the outcome back.
#[derive(Debug, Clone)]
pub struct RegistrationPreKeyUploadBundle {
    identity: Identity,
    identity_key_pair: IdentityKeyPair,
    signed_pre_key: SignedPreKeyRecord,
    last_resort_pre_key: KyberPreKeyRecord,
}

impl RegistrationPreKeyUploadBundle {
    pub fn new(
        identity: Identity,
        identity_key_pair: IdentityKeyPair,
        signed_pre_key: SignedPreKeyRecord,
        last_resort_pre_key: KyberPreKeyRecord,
    ) -> Self {
        Self {
            identity,
            identity_key_pair,
            signed_pre_key,
            last_resort_pre_key,
        }
    }

    pub fn identity_key_pair(&self) -> &IdentityKeyPair {
        &self.identity_key_pair
    }

    pub fn signed_pre_key_record(&self) -> &SignedPreKeyRecord {
        &self.signed_pre_key
    }

    pub fn last_resort_pre_key_record(&self) -> &KyberPreKeyRecord {
        &self.last_resort_pre_key
    }
}

impl PreKeyUploadBundle for RegistrationPreKeyUploadBundle {
    fn identity(&self) -> Identity {
        self.identity
    }

    fn signed_pre_key(&self) -> Option<&SignedPreKeyRecord> {
        Some(&self.signed_pre_key)
    }

    fn pre_key_records(&self) -> Option<&[PreKeyRecord]> {
        None
    }

    fn last_resort_pre_key(&self) -> Option<&KyberPreKeyRecord> {
        Some(&self.last_resort_pre_key)
    }

    fn pq_pre_key_records(&self) -> Option<&[KyberPreKeyRecord]> {
        None
    }
}

/// ACI and PNI registration bundles, created and finalized together.
#[derive(Debug, Clone)]
pub struct RegistrationPreKeyUploadBundles {
    pub aci: RegistrationPreKeyUploadBundle,
    pub pni: RegistrationPreKeyUploadBundle,
}

impl RegistrationPreKeyUploadBundles {
    pub fn iter(&self) -> impl Iterator<Item = &RegistrationPreKeyUploadBundle> {
        [&self.aci, &self.pni].into_iter()
    }
}
