//! Runs individual pre-key tasks.
//!
//! Every task follows the same phases, skipping the ones its
//! [`PreKeyAction`] does not need:
//! 1. wait for message processing to go idle
//! 2. fetch the server's remaining one-time key counts
//! 3. narrow the requested targets to those actually due
//! 4. generate the keys (one write transaction)
//! 5. upload them
//! 6. persist them and cull what they supersede (one write transaction)
//!
//! Registration and provisioning persist before the caller uploads, and
//! are finalized by [`PreKeyTaskManager::persist_after_registration`].
//!
//! The manager holds no state of its own between tasks.

use std::sync::Arc;

use kindling_crypto::{Identity, IdentityKeyPair, Timestamp};
use kindling_service::{AccountServiceClient, ChatServiceAuth, PreKeyCounts};
use kindling_store::{KeyDatabase, ProtocolStoreManager, RetentionPolicy, Transaction};
use tokio_util::sync::CancellationToken;

use crate::action::PreKeyAction;
use crate::bundle::{
    PartialPreKeyUploadBundle, PreKeyUploadBundle, RegistrationPreKeyUploadBundle,
    RegistrationPreKeyUploadBundles,
};
use crate::config::PreKeyConfig;
use crate::context::{
    duration_millis, Clock, LinkedDevicePniKeyManager, MessageProcessor, PreKeyContext,
};
use crate::error::PreKeyError;
use crate::generator::KeyGenerator;
use crate::target::{PreKeyTarget, Targets};
use crate::uploader::{BundleUploader, UploadResult};

pub struct PreKeyTaskManager {
    db: KeyDatabase,
    stores: ProtocolStoreManager,
    generator: KeyGenerator,
    uploader: BundleUploader,
    service: Arc<dyn AccountServiceClient>,
    message_processor: Arc<dyn MessageProcessor>,
    pni_key_manager: Arc<dyn LinkedDevicePniKeyManager>,
    clock: Arc<dyn Clock>,
    config: PreKeyConfig,
    retention: RetentionPolicy,
}

fn check_cancellation(cancel: &CancellationToken) -> Result<(), PreKeyError> {
    if cancel.is_cancelled() {
        Err(PreKeyError::Cancelled)
    } else {
        Ok(())
    }
}

impl PreKeyTaskManager {
    pub fn new(context: &PreKeyContext) -> Self {
        let stores = ProtocolStoreManager::new();
        Self {
            db: context.db.clone(),
            stores,
            generator: KeyGenerator::new(
                stores,
                Arc::clone(&context.clock),
                context.config.one_time_batch_size,
                context.config.pq_one_time_batch_size,
            ),
            uploader: BundleUploader::new(Arc::clone(&context.service)),
            service: Arc::clone(&context.service),
            message_processor: Arc::clone(&context.message_processor),
            pni_key_manager: Arc::clone(&context.pni_key_manager),
            clock: Arc::clone(&context.clock),
            config: context.config.clone(),
            retention: context.config.retention_policy(),
        }
    }

    // ── Registration / provisioning ─────────────────────────────────

    /// Create (or reuse) both identity keys and generate registration
    /// bundles for ACI and PNI, stored but not yet accepted.
    #[tracing::instrument(name = "pre_key_task", skip_all, fields(action = %PreKeyAction::CreateForRegistration))]
    pub async fn create_for_registration(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RegistrationPreKeyUploadBundles, PreKeyError> {
        tracing::info!("create for registration");
        check_cancellation(cancel)?;
        self.create_registration_bundles(PreKeyAction::CreateForRegistration, None)
    }

    /// Like registration, but with identity keys supplied by the primary
    /// device. The supplied keys are stored alongside the bundles.
    #[tracing::instrument(name = "pre_key_task", skip_all, fields(action = %PreKeyAction::CreateForProvisioning))]
    pub async fn create_for_provisioning(
        &self,
        aci_identity_key_pair: IdentityKeyPair,
        pni_identity_key_pair: IdentityKeyPair,
        cancel: &CancellationToken,
    ) -> Result<RegistrationPreKeyUploadBundles, PreKeyError> {
        tracing::info!("create for provisioning");
        check_cancellation(cancel)?;
        self.create_registration_bundles(
            PreKeyAction::CreateForProvisioning,
            Some((aci_identity_key_pair, pni_identity_key_pair)),
        )
    }

    /// Generate both registration bundles in one transaction. Records are
    /// stored up front when `action` persists prior to upload; otherwise
    /// nothing but the identity keys is written until the caller finalizes.
    fn create_registration_bundles(
        &self,
        action: PreKeyAction,
        supplied: Option<(IdentityKeyPair, IdentityKeyPair)>,
    ) -> Result<RegistrationPreKeyUploadBundles, PreKeyError> {
        let now = self.clock.now();
        let (aci_key_pair, pni_key_pair) = supplied.unzip();
        self.db.write(|tx| {
            let aci = self.registration_bundle(tx, Identity::Aci, aci_key_pair)?;
            let pni = self.registration_bundle(tx, Identity::Pni, pni_key_pair)?;
            if action.persists_prior_to_upload() {
                self.persist_keys_prior_to_upload(tx, &aci, now)?;
                self.persist_keys_prior_to_upload(tx, &pni, now)?;
            }
            Ok(RegistrationPreKeyUploadBundles { aci, pni })
        })
    }

    fn registration_bundle(
        &self,
        tx: &Transaction<'_>,
        identity: Identity,
        supplied: Option<IdentityKeyPair>,
    ) -> Result<RegistrationPreKeyUploadBundle, PreKeyError> {
        let identity_key_pair = match supplied {
            Some(key_pair) => {
                self.stores
                    .for_identity(identity)
                    .identity_keys
                    .store_identity_key_pair(tx, &key_pair)?;
                key_pair
            }
            None => self.generator.get_or_create_identity_key_pair(tx, identity)?,
        };
        self.generator
            .create_registration_bundle(tx, identity, identity_key_pair)
    }

    /// Finish a registration: mark the bundles accepted and current if the
    /// caller's upload succeeded, otherwise remove what was stored for them.
    #[tracing::instrument(name = "pre_key_task", skip_all, fields(action = %PreKeyAction::PersistAfterRegistration))]
    pub async fn persist_after_registration(
        &self,
        bundles: &RegistrationPreKeyUploadBundles,
        upload_did_succeed: bool,
        cancel: &CancellationToken,
    ) -> Result<(), PreKeyError> {
        tracing::info!(upload_did_succeed, "persist after registration");
        check_cancellation(cancel)?;
        let now = self.clock.now();
        self.db.write(|tx| {
            for bundle in bundles.iter() {
                if upload_did_succeed {
                    self.persist_keys_after_upload(tx, bundle, now)?;
                } else {
                    self.wipe_keys_after_failed_registration(tx, bundle)?;
                }
            }
            Ok(())
        })
    }

    // ── Standard operations ─────────────────────────────────────────

    /// Regenerate only the targets that are due. May do nothing at all.
    pub async fn refresh(
        &self,
        identity: Identity,
        targets: &Targets,
        auth: &ChatServiceAuth,
        cancel: &CancellationToken,
    ) -> Result<(), PreKeyError> {
        self.run(PreKeyAction::Refresh, identity, targets.clone(), auth, cancel)
            .await
    }

    /// Regenerate every requested target unconditionally.
    pub async fn rotate(
        &self,
        identity: Identity,
        targets: &Targets,
        auth: &ChatServiceAuth,
        cancel: &CancellationToken,
    ) -> Result<(), PreKeyError> {
        self.run(PreKeyAction::Rotate, identity, targets.clone(), auth, cancel)
            .await
    }

    /// One batch each of EC and ML-KEM one-time keys. Used right after
    /// registration, so it does not wait for message processing.
    pub async fn create_one_time_pre_keys(
        &self,
        identity: Identity,
        auth: &ChatServiceAuth,
        cancel: &CancellationToken,
    ) -> Result<(), PreKeyError> {
        let mut targets = Targets::from([PreKeyTarget::OneTimePreKey]);
        if self.config.enable_pq_pre_keys {
            targets.insert(PreKeyTarget::OneTimePqPreKey);
        }
        self.run(PreKeyAction::CreateOneTimePreKeys, identity, targets, auth, cancel)
            .await
    }

    /// Rotate PNI keys, creating the PNI identity key first if there is none.
    pub async fn create_or_rotate_pni_keys(
        &self,
        targets: &Targets,
        auth: &ChatServiceAuth,
        cancel: &CancellationToken,
    ) -> Result<(), PreKeyError> {
        self.run(
            PreKeyAction::CreateOrRotatePniKeys,
            Identity::Pni,
            targets.clone(),
            auth,
            cancel,
        )
        .await
    }

    #[tracing::instrument(name = "pre_key_task", skip_all, fields(%action, %identity))]
    async fn run(
        &self,
        action: PreKeyAction,
        identity: Identity,
        targets: Targets,
        auth: &ChatServiceAuth,
        cancel: &CancellationToken,
    ) -> Result<(), PreKeyError> {
        tracing::info!(%targets, "starting");
        check_cancellation(cancel)?;

        if action.waits_for_message_processing() {
            self.wait_for_message_processing(cancel).await?;
            check_cancellation(cancel)?;
        }

        let targets = if action.filters_targets() {
            let counts = if targets.needs_remote_count() {
                Some(self.service.get_pre_key_counts(identity).await?)
            } else {
                None
            };
            check_cancellation(cancel)?;
            let filtered = self.filter_to_necessary_targets(identity, &targets, counts)?;
            tracing::info!(targets = %filtered, "filtered targets");
            filtered
        } else {
            targets
        };

        let bundle = self.db.write(|tx| {
            let identity_key_pair = if action.may_create_identity_key() {
                self.generator.get_or_create_identity_key_pair(tx, identity)?
            } else {
                self.generator.require_identity_key_pair(tx, identity)?
            };
            self.generator
                .create_partial_bundle(tx, identity, &identity_key_pair, &targets)
        })?;

        // Last point at which a cancel is honoured; once the server has
        // the keys they are persisted regardless.
        check_cancellation(cancel)?;
        self.upload_and_persist_bundle(&bundle, auth).await
    }

    // ── Phases ──────────────────────────────────────────────────────

    /// Narrow `targets` to the kinds that are actually due. A one-time kind
    /// with no fetched count is dropped rather than failing the task.
    pub fn filter_to_necessary_targets(
        &self,
        identity: Identity,
        targets: &Targets,
        counts: Option<PreKeyCounts>,
    ) -> Result<Targets, PreKeyError> {
        let store = self.stores.for_identity(identity);
        let (current_signed, current_last_resort) = self.db.read(|conn| {
            Ok::<_, PreKeyError>((
                store.signed_pre_keys.current_signed_pre_key(conn)?,
                store.kyber_pre_keys.last_resort_kyber_pre_key(conn)?,
            ))
        })?;
        let now = self.clock.now();

        let mut necessary = Targets::empty();
        for target in targets.iter() {
            let due = match target {
                PreKeyTarget::OneTimePreKey => match counts {
                    Some(counts) if counts.ec < self.config.ec_minimum_count => true,
                    Some(counts) => {
                        tracing::info!(%identity, count = counts.ec, "available one-time keys sufficient");
                        false
                    }
                    None => {
                        tracing::warn!(%identity, "did not fetch pre-key count, skipping one-time keys");
                        false
                    }
                },
                PreKeyTarget::OneTimePqPreKey => match counts {
                    Some(counts) if counts.pq < self.config.pq_minimum_count => true,
                    Some(counts) => {
                        tracing::info!(%identity, count = counts.pq, "available PQ one-time keys sufficient");
                        false
                    }
                    None => {
                        tracing::warn!(%identity, "did not fetch PQ pre-key count, skipping PQ one-time keys");
                        false
                    }
                },
                PreKeyTarget::SignedPreKey => match &current_signed {
                    Some(record)
                        if now.saturating_sub(record.generated_at())
                            < duration_millis(self.config.signed_rotation_interval) =>
                    {
                        tracing::info!(%identity, generated_at = record.generated_at(), "signed pre-key sufficient");
                        false
                    }
                    _ => true,
                },
                PreKeyTarget::LastResortPqPreKey => match &current_last_resort {
                    Some(record)
                        if now.saturating_sub(record.generated_at())
                            < duration_millis(self.config.last_resort_rotation_interval) =>
                    {
                        tracing::info!(%identity, generated_at = record.generated_at(), "last-resort pre-key sufficient");
                        false
                    }
                    _ => true,
                },
            };
            if due {
                necessary.insert(target);
            }
        }
        Ok(necessary)
    }

    /// Wait for message processing, waking every recheck interval so a
    /// cancelled task does not hang behind a busy pipeline.
    async fn wait_for_message_processing(&self, cancel: &CancellationToken) -> Result<(), PreKeyError> {
        loop {
            check_cancellation(cancel)?;
            let wait = tokio::time::timeout(
                self.config.message_processing_recheck,
                self.message_processor.wait_for_processing_complete(),
            );
            tokio::select! {
                () = cancel.cancelled() => return Err(PreKeyError::Cancelled),
                result = wait => match result {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(e)) => return Err(PreKeyError::MessageProcessingFailed(e.to_string())),
                    Err(_) => tracing::debug!("message processing still busy, rechecking"),
                },
            }
        }
    }

    /// Store generated records without marking anything accepted or current.
    fn persist_keys_prior_to_upload(
        &self,
        tx: &Transaction<'_>,
        bundle: &dyn PreKeyUploadBundle,
        now: Timestamp,
    ) -> Result<(), PreKeyError> {
        let store = self.stores.for_identity(bundle.identity());
        if let Some(record) = bundle.signed_pre_key() {
            store.signed_pre_keys.store_signed_pre_key(tx, record)?;
        }
        if let Some(record) = bundle.last_resort_pre_key() {
            store
                .kyber_pre_keys
                .store_kyber_pre_keys(tx, std::slice::from_ref(record), now)?;
        }
        if let Some(records) = bundle.pre_key_records() {
            store.pre_keys.store_pre_keys(tx, records, now)?;
        }
        if let Some(records) = bundle.pq_pre_key_records() {
            store.kyber_pre_keys.store_kyber_pre_keys(tx, records, now)?;
        }
        Ok(())
    }

    /// Store records the server accepted, make signed and last-resort keys
    /// current, record the rotation and cull what they supersede.
    fn persist_keys_after_upload(
        &self,
        tx: &Transaction<'_>,
        bundle: &dyn PreKeyUploadBundle,
        now: Timestamp,
    ) -> Result<(), PreKeyError> {
        let store = self.stores.for_identity(bundle.identity());

        if let Some(record) = bundle.signed_pre_key() {
            store
                .signed_pre_keys
                .store_signed_pre_key_as_accepted_and_current(tx, record)?;
            store.signed_pre_keys.set_last_successful_rotation(tx, now)?;
            store
                .signed_pre_keys
                .cull_signed_pre_keys(tx, &self.retention, now)?;
        }

        if let Some(record) = bundle.last_resort_pre_key() {
            store
                .kyber_pre_keys
                .store_last_resort_pre_key_and_mark_as_current(tx, record, now)?;
            store.kyber_pre_keys.set_last_successful_rotation(tx, now)?;
            store
                .kyber_pre_keys
                .cull_last_resort_kyber_pre_keys(tx, &self.retention, now)?;
        }

        if let Some(records) = bundle.pre_key_records() {
            store.pre_keys.store_pre_keys(tx, records, now)?;
            store.pre_keys.cull_pre_keys(tx, &self.retention, now)?;
        }

        if let Some(records) = bundle.pq_pre_key_records() {
            store.kyber_pre_keys.store_kyber_pre_keys(tx, records, now)?;
            store
                .kyber_pre_keys
                .cull_one_time_kyber_pre_keys(tx, &self.retention, now)?;
        }
        Ok(())
    }

    /// Remove the signed and last-resort keys stored for a registration that
    /// the server never accepted. Identity keys are kept for the next attempt.
    fn wipe_keys_after_failed_registration(
        &self,
        tx: &Transaction<'_>,
        bundle: &RegistrationPreKeyUploadBundle,
    ) -> Result<(), PreKeyError> {
        let store = self.stores.for_identity(bundle.identity());
        store
            .signed_pre_keys
            .remove_signed_pre_key(tx, bundle.signed_pre_key_record().id())?;
        store
            .kyber_pre_keys
            .remove_kyber_pre_key(tx, bundle.last_resort_pre_key_record().id())?;
        tracing::info!(identity = %bundle.identity(), "wiped keys after failed registration");
        Ok(())
    }

    async fn upload_and_persist_bundle(
        &self,
        bundle: &PartialPreKeyUploadBundle,
        auth: &ChatServiceAuth,
    ) -> Result<(), PreKeyError> {
        let identity = bundle.identity();
        match self.uploader.upload(bundle, auth).await {
            UploadResult::Skipped => {
                tracing::info!(%identity, "no keys to upload");
                Ok(())
            }
            UploadResult::Success => {
                tracing::info!(%identity, "uploaded pre-keys");
                let now = self.clock.now();
                self.db
                    .write(|tx| self.persist_keys_after_upload(tx, bundle, now))
            }
            UploadResult::IncorrectIdentityKeyOnLinkedDevice => {
                if identity != Identity::Pni {
                    tracing::error!(%identity, "server rejected identity key on a non-PNI upload");
                    return Err(PreKeyError::IdentityKeyMismatch(identity));
                }
                self.db.write(|tx| {
                    self.pni_key_manager
                        .record_suspected_issue_with_pni_identity_key(tx)
                })?;
                Ok(())
            }
            UploadResult::Failure(e) => {
                tracing::warn!(%identity, error = %e, "failed to upload pre-keys");
                Err(e.into())
            }
        }
    }
}
