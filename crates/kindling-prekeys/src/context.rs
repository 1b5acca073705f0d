//! Collaborators the pre-key manager consumes but does not own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use kindling_crypto::{Identity, Timestamp};
use kindling_service::AccountServiceClient;
use kindling_store::{metadata, KeyDatabase, StoreError, Transaction};
use tokio::sync::watch;

use crate::config::PreKeyConfig;

/// The decryption pipeline. Pre-key rotation waits for it to drain so no
/// in-flight message depends on a key about to be superseded.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Resolves once all fetched messages have been processed.
    async fn wait_for_processing_complete(&self) -> anyhow::Result<()>;
}

/// [`MessageProcessor`] driven by a watch channel: `true` means idle.
#[derive(Clone)]
pub struct MessageProcessingState {
    idle: Arc<watch::Sender<bool>>,
}

impl MessageProcessingState {
    pub fn new(idle: bool) -> Self {
        let (tx, _rx) = watch::channel(idle);
        Self { idle: Arc::new(tx) }
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.send_replace(idle);
    }

    pub fn is_idle(&self) -> bool {
        *self.idle.borrow()
    }
}

#[async_trait]
impl MessageProcessor for MessageProcessingState {
    async fn wait_for_processing_complete(&self) -> anyhow::Result<()> {
        let mut rx = self.idle.subscribe();
        rx.wait_for(|idle| *idle)
            .await
            .map_err(|e| anyhow::anyhow!("message processing state closed: {e}"))?;
        Ok(())
    }
}

/// Registration state of the local account.
pub trait AccountState: Send + Sync {
    fn is_registered(&self) -> bool;

    /// Whether the account has a phone-number identity.
    fn has_pni(&self) -> bool;
}

pub trait AppLifecycle: Send + Sync {
    /// True when running as the main app and in the foreground.
    fn is_main_app_and_active(&self) -> bool;
}

/// Told when the server rejects our PNI identity key on a linked device.
pub trait LinkedDevicePniKeyManager: Send + Sync {
    fn record_suspected_issue_with_pni_identity_key(
        &self,
        tx: &Transaction<'_>,
    ) -> Result<(), StoreError>;
}

const PNI_ISSUE_SCOPE: &str = "pni";
const PNI_ISSUE_KEY: &str = "suspected_identity_key_issue";

/// [`LinkedDevicePniKeyManager`] that keeps the flag in the key database
/// for a reconciliation job to pick up.
#[derive(Clone)]
pub struct PniIdentityKeyIssueFlag {
    db: KeyDatabase,
}

impl PniIdentityKeyIssueFlag {
    pub fn new(db: KeyDatabase) -> Self {
        Self { db }
    }

    pub fn has_suspected_issue(&self) -> Result<bool, StoreError> {
        let value = self
            .db
            .read(|conn| metadata::get(conn, PNI_ISSUE_SCOPE, PNI_ISSUE_KEY))?;
        Ok(value.unwrap_or(0) != 0)
    }

    pub fn clear_suspected_issue(&self) -> Result<(), StoreError> {
        self.db
            .write(|tx| metadata::delete(tx, PNI_ISSUE_SCOPE, PNI_ISSUE_KEY))
    }
}

impl LinkedDevicePniKeyManager for PniIdentityKeyIssueFlag {
    fn record_suspected_issue_with_pni_identity_key(
        &self,
        tx: &Transaction<'_>,
    ) -> Result<(), StoreError> {
        tracing::warn!("recording suspected PNI identity key issue");
        metadata::set(tx, PNI_ISSUE_SCOPE, PNI_ISSUE_KEY, 1)
    }
}

/// Milliseconds in `duration`, saturating.
pub(crate) fn duration_millis(duration: Duration) -> Timestamp {
    Timestamp::try_from(duration.as_millis()).unwrap_or(Timestamp::MAX)
}

/// Source of `generated_at` and health timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .try_into()
            .unwrap_or(Timestamp::MAX)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_millis(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Everything a [`crate::PreKeyManager`] needs from the rest of the client.
#[derive(Clone)]
pub struct PreKeyContext {
    pub db: KeyDatabase,
    pub service: Arc<dyn AccountServiceClient>,
    pub message_processor: Arc<dyn MessageProcessor>,
    pub account: Arc<dyn AccountState>,
    pub app: Arc<dyn AppLifecycle>,
    pub pni_key_manager: Arc<dyn LinkedDevicePniKeyManager>,
    pub clock: Arc<dyn Clock>,
    pub config: PreKeyConfig,
}

impl PreKeyContext {
    /// Identities the account currently holds keys for, ACI first.
    pub fn registered_identities(&self) -> Vec<Identity> {
        if !self.account.is_registered() {
            return Vec::new();
        }
        Identity::ALL
            .into_iter()
            .filter(|identity| *identity == Identity::Aci || self.account.has_pni())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_on_request() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now(), 3_000);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn pni_issue_flag_roundtrip() {
        let db = KeyDatabase::open_in_memory().unwrap();
        let flag = PniIdentityKeyIssueFlag::new(db.clone());
        assert!(!flag.has_suspected_issue().unwrap());

        db.write(|tx| flag.record_suspected_issue_with_pni_identity_key(tx))
            .unwrap();
        assert!(flag.has_suspected_issue().unwrap());

        flag.clear_suspected_issue().unwrap();
        assert!(!flag.has_suspected_issue().unwrap());
    }

    #[tokio::test]
    async fn processing_state_resolves_when_idle() {
        let state = MessageProcessingState::new(false);
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_for_processing_complete().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        state.set_idle(true);
        waiter.await.unwrap().unwrap();
        assert!(state.is_idle());
    }
}
