//! Public entry point for pre-key maintenance.
//!
//! Every operation is funnelled through one [`OperationQueue`], so tasks for
//! ACI and PNI never interleave. Each operation gets a child of the
//! manager's shutdown token; [`PreKeyManager::shutdown`] cancels them all.

use std::future::Future;
use std::sync::Arc;

use kindling_crypto::{Identity, IdentityKeyPair, Timestamp};
use kindling_service::ChatServiceAuth;
use kindling_store::ProtocolStoreManager;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bundle::RegistrationPreKeyUploadBundles;
use crate::context::{duration_millis, PreKeyContext};
use crate::error::PreKeyError;
use crate::queue::OperationQueue;
use crate::target::{PreKeyTarget, Targets};
use crate::task_manager::PreKeyTaskManager;

struct Inner {
    context: PreKeyContext,
    tasks: PreKeyTaskManager,
    stores: ProtocolStoreManager,
    /// When `check_pre_keys_if_necessary` last completed successfully.
    last_successful_check: Mutex<Option<Timestamp>>,
}

pub struct PreKeyManager {
    inner: Arc<Inner>,
    queue: OperationQueue,
    shutdown: CancellationToken,
}

impl PreKeyManager {
    /// Must be called from within a tokio runtime.
    pub fn new(context: PreKeyContext) -> Self {
        let tasks = PreKeyTaskManager::new(&context);
        Self {
            inner: Arc::new(Inner {
                context,
                tasks,
                stores: ProtocolStoreManager::new(),
                last_successful_check: Mutex::new(None),
            }),
            queue: OperationQueue::new(),
            shutdown: CancellationToken::new(),
        }
    }

    async fn submit<T, F, Fut>(&self, operation: F) -> Result<T, PreKeyError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Inner>, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, PreKeyError>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(PreKeyError::ShutDown);
        }
        let cancel = self.shutdown.child_token();
        self.queue
            .run(operation(Arc::clone(&self.inner), cancel))
            .await
    }

    /// Whether outgoing messages should be blocked until keys are healthy.
    ///
    /// True if either identity has a failure streak of at least the
    /// configured count lasting at least the configured duration, or if a
    /// last successful rotation is older than the staleness threshold.
    /// An identity that has never rotated is not considered stale.
    pub fn is_app_locked_due_to_pre_key_update_failures(&self) -> Result<bool, PreKeyError> {
        self.inner.is_app_locked()
    }

    /// Throttled periodic health check. Does nothing unless the app is the
    /// active main app, the account is registered, and the throttle window
    /// has passed since the last successful check.
    pub async fn check_pre_keys_if_necessary(&self) -> Result<(), PreKeyError> {
        if !self.inner.context.app.is_main_app_and_active() {
            tracing::debug!("app not active, skipping pre-key check");
            return Ok(());
        }
        self.submit(|inner, cancel| async move { inner.check_pre_keys(&cancel).await })
            .await
    }

    /// Phase one of registration: identity keys plus a registration bundle
    /// for each identity, stored locally but not yet current.
    pub async fn create_pre_keys_for_registration(
        &self,
    ) -> Result<RegistrationPreKeyUploadBundles, PreKeyError> {
        self.submit(|inner, cancel| async move {
            inner.tasks.create_for_registration(&cancel).await
        })
        .await
    }

    /// Phase one of provisioning a linked device, with identity keys taken
    /// from the primary device.
    pub async fn create_pre_keys_for_provisioning(
        &self,
        aci_identity_key_pair: IdentityKeyPair,
        pni_identity_key_pair: IdentityKeyPair,
    ) -> Result<RegistrationPreKeyUploadBundles, PreKeyError> {
        self.submit(|inner, cancel| async move {
            inner
                .tasks
                .create_for_provisioning(aci_identity_key_pair, pni_identity_key_pair, &cancel)
                .await
        })
        .await
    }

    /// Final phase: commit the bundles if the registration request succeeded,
    /// otherwise discard them.
    pub async fn finalize_registration_pre_keys(
        &self,
        bundles: RegistrationPreKeyUploadBundles,
        upload_did_succeed: bool,
    ) -> Result<(), PreKeyError> {
        self.submit(|inner, cancel| async move {
            inner
                .tasks
                .persist_after_registration(&bundles, upload_did_succeed, &cancel)
                .await
        })
        .await
    }

    /// Upload the first batch of one-time keys for both identities.
    pub async fn rotate_one_time_pre_keys_for_registration(
        &self,
        auth: ChatServiceAuth,
    ) -> Result<(), PreKeyError> {
        self.submit(|inner, cancel| async move {
            for identity in Identity::ALL {
                inner
                    .tasks
                    .create_one_time_pre_keys(identity, &auth, &cancel)
                    .await?;
            }
            Ok(())
        })
        .await
    }

    pub async fn create_or_rotate_pni_pre_keys(
        &self,
        auth: ChatServiceAuth,
    ) -> Result<(), PreKeyError> {
        self.submit(|inner, cancel| async move {
            let targets = inner.all_targets();
            inner
                .tasks
                .create_or_rotate_pni_keys(&targets, &auth, &cancel)
                .await
        })
        .await
    }

    /// Unconditionally rotate the signed pre-key (and last-resort key when
    /// post-quantum keys are enabled) of every registered identity.
    pub async fn rotate_signed_pre_keys(&self) -> Result<(), PreKeyError> {
        self.submit(|inner, cancel| async move { inner.rotate_signed(&cancel).await })
            .await
    }

    /// Rotate signed pre-keys only while the app is locked because of them.
    pub async fn rotate_signed_pre_keys_if_needed(&self) -> Result<(), PreKeyError> {
        if !self.is_app_locked_due_to_pre_key_update_failures()? {
            return Ok(());
        }
        tracing::info!("app locked due to pre-key failures, rotating signed pre-keys");
        self.rotate_signed_pre_keys().await
    }

    /// Top up one-time keys for `identity`, optionally also refreshing its
    /// signed and last-resort keys. Only kinds that are due are regenerated.
    pub async fn refresh_one_time_pre_keys(
        &self,
        identity: Identity,
        also_refresh_signed_pre_key: bool,
    ) -> Result<(), PreKeyError> {
        self.submit(move |inner, cancel| async move {
            if !inner.context.account.is_registered() {
                tracing::info!("not registered, skipping one-time pre-key refresh");
                return Ok(());
            }
            let mut targets = Targets::from([PreKeyTarget::OneTimePreKey, PreKeyTarget::OneTimePqPreKey]);
            if also_refresh_signed_pre_key {
                targets.insert(PreKeyTarget::SignedPreKey);
                targets.insert(PreKeyTarget::LastResortPqPreKey);
            }
            let targets = inner.gate_pq(targets);
            inner
                .refresh(identity, &targets, &ChatServiceAuth::Implicit, &cancel)
                .await
        })
        .await
    }

    /// Cancel in-flight tasks and stop accepting new ones.
    pub fn shutdown(&self) {
        tracing::info!("shutting down pre-key manager");
        self.shutdown.cancel();
        self.queue.close();
    }
}

impl Drop for PreKeyManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Inner {
    fn gate_pq(&self, targets: Targets) -> Targets {
        if self.context.config.enable_pq_pre_keys {
            targets
        } else {
            targets.without_pq()
        }
    }

    fn all_targets(&self) -> Targets {
        self.gate_pq(Targets::all())
    }

    fn is_app_locked(&self) -> Result<bool, PreKeyError> {
        let config = &self.context.config;
        let now = self.context.clock.now();
        let failure_duration = duration_millis(config.app_lock_failure_duration);
        let staleness = duration_millis(config.rotation_staleness);

        self.context.db.read(|conn| {
            for identity in Identity::ALL {
                let store = self.stores.for_identity(identity);

                let failures = store.signed_pre_keys.pre_key_update_failure_count(conn)?;
                if failures >= config.app_lock_failure_count {
                    if let Some(first) = store.signed_pre_keys.first_pre_key_update_failure(conn)? {
                        if now.saturating_sub(first) >= failure_duration {
                            tracing::warn!(%identity, failures, "pre-key updates failing for too long");
                            return Ok(true);
                        }
                    }
                }

                let mut rotations = vec![store.signed_pre_keys.last_successful_rotation(conn)?];
                if config.enable_pq_pre_keys {
                    rotations.push(store.kyber_pre_keys.last_successful_rotation(conn)?);
                }
                if rotations
                    .into_iter()
                    .flatten()
                    .any(|at| now.saturating_sub(at) >= staleness)
                {
                    tracing::warn!(%identity, "last successful pre-key rotation is stale");
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    async fn check_pre_keys(&self, cancel: &CancellationToken) -> Result<(), PreKeyError> {
        if !self.context.account.is_registered() {
            tracing::debug!("not registered, skipping pre-key check");
            return Ok(());
        }

        let now = self.context.clock.now();
        let last_check = *self.last_successful_check.lock();
        if let Some(last) = last_check {
            if now.saturating_sub(last) < duration_millis(self.context.config.check_throttle) {
                tracing::debug!("pre-key check throttled");
                return Ok(());
            }
        }

        let targets = self.all_targets();
        let auth = ChatServiceAuth::Implicit;
        self.refresh(Identity::Aci, &targets, &auth, cancel).await?;

        if self.context.account.has_pni() {
            match self.refresh(Identity::Pni, &targets, &auth, cancel).await {
                Ok(()) => {}
                Err(PreKeyError::NoIdentityKey(identity)) => {
                    tracing::warn!(%identity, "no PNI identity key yet, skipping PNI pre-key check");
                }
                Err(e) => return Err(e),
            }
        }

        *self.last_successful_check.lock() = Some(self.context.clock.now());
        Ok(())
    }

    async fn rotate_signed(&self, cancel: &CancellationToken) -> Result<(), PreKeyError> {
        let identities = self.context.registered_identities();
        if identities.is_empty() {
            tracing::info!("not registered, skipping signed pre-key rotation");
            return Ok(());
        }
        let targets = self.gate_pq(Targets::from([
            PreKeyTarget::SignedPreKey,
            PreKeyTarget::LastResortPqPreKey,
        ]));
        let auth = ChatServiceAuth::Implicit;
        for identity in identities {
            let result = self.tasks.rotate(identity, &targets, &auth, cancel).await;
            self.record_outcome(identity, &targets, result)?;
        }
        Ok(())
    }

    async fn refresh(
        &self,
        identity: Identity,
        targets: &Targets,
        auth: &ChatServiceAuth,
        cancel: &CancellationToken,
    ) -> Result<(), PreKeyError> {
        let result = self.tasks.refresh(identity, targets, auth, cancel).await;
        self.record_outcome(identity, targets, result)
    }

    /// Extend the identity's failure streak when a signed pre-key update
    /// failed for a reason other than an expected or transient condition.
    fn record_outcome(
        &self,
        identity: Identity,
        targets: &Targets,
        result: Result<(), PreKeyError>,
    ) -> Result<(), PreKeyError> {
        let Err(error) = result else {
            return Ok(());
        };
        if targets.contains(PreKeyTarget::SignedPreKey) && error.counts_as_update_failure() {
            let now = self.context.clock.now();
            let store = self.stores.for_identity(identity);
            match self
                .context
                .db
                .write(|tx| store.signed_pre_keys.increment_pre_key_update_failure_count(tx, now))
            {
                Ok(failures) => {
                    tracing::warn!(%identity, failures, error = %error, "signed pre-key update failed");
                }
                Err(e) => {
                    tracing::error!(%identity, error = %e, "failed to record pre-key update failure");
                }
            }
        }
        Err(error)
    }
}
