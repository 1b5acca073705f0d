#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kindling_crypto::Identity;
use kindling_prekeys::{
    AccountState, AppLifecycle, ManualClock, MessageProcessingState, PniIdentityKeyIssueFlag,
    PreKeyConfig, PreKeyContext,
};
use kindling_service::{AccountServiceClient, ChatServiceAuth, PreKeyCounts, ServiceError, SetKeysRequest};
use kindling_store::KeyDatabase;
use parking_lot::Mutex;

pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// 2026-01-01T00:00:00Z in milliseconds.
pub const START: u64 = 1_767_225_600_000;

#[derive(Debug, Clone, Copy)]
pub enum UploadFailure {
    Status(u16),
    Network,
}

#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub identity: Identity,
    pub request: SetKeysRequest,
    pub auth: ChatServiceAuth,
}

/// In-memory account service.
#[derive(Default)]
pub struct FakeService {
    counts: Mutex<HashMap<Identity, PreKeyCounts>>,
    uploads: Mutex<Vec<RecordedUpload>>,
    count_calls: AtomicUsize,
    upload_failure: Mutex<Option<UploadFailure>>,
}

impl FakeService {
    pub fn set_counts(&self, identity: Identity, ec: u32, pq: u32) {
        self.counts.lock().insert(identity, PreKeyCounts { ec, pq });
    }

    pub fn fail_uploads_with(&self, failure: Option<UploadFailure>) {
        *self.upload_failure.lock() = failure;
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().clone()
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountServiceClient for FakeService {
    async fn get_pre_key_counts(&self, identity: Identity) -> Result<PreKeyCounts, ServiceError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .counts
            .lock()
            .get(&identity)
            .copied()
            .unwrap_or_default())
    }

    async fn set_pre_keys(
        &self,
        identity: Identity,
        request: &SetKeysRequest,
        auth: &ChatServiceAuth,
    ) -> Result<(), ServiceError> {
        let failure = *self.upload_failure.lock();
        match failure {
            Some(UploadFailure::Status(status)) => Err(ServiceError::Http {
                status,
                message: "rejected".to_string(),
            }),
            Some(UploadFailure::Network) => Err(ServiceError::Network("connection reset".to_string())),
            None => {
                self.uploads.lock().push(RecordedUpload {
                    identity,
                    request: request.clone(),
                    auth: auth.clone(),
                });
                Ok(())
            }
        }
    }
}

pub struct FakeAccount {
    pub registered: AtomicBool,
    pub has_pni: AtomicBool,
}

impl AccountState for FakeAccount {
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn has_pni(&self) -> bool {
        self.has_pni.load(Ordering::SeqCst)
    }
}

pub struct FakeApp {
    pub active: AtomicBool,
}

impl AppLifecycle for FakeApp {
    fn is_main_app_and_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// A context wired to fakes, plus handles to drive them.
pub struct Harness {
    pub db: KeyDatabase,
    pub service: Arc<FakeService>,
    pub processing: MessageProcessingState,
    pub account: Arc<FakeAccount>,
    pub app: Arc<FakeApp>,
    pub pni_flag: PniIdentityKeyIssueFlag,
    pub clock: Arc<ManualClock>,
    pub context: PreKeyContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(small_config())
    }

    pub fn with_config(config: PreKeyConfig) -> Self {
        let db = KeyDatabase::open_in_memory().unwrap();
        let service = Arc::new(FakeService::default());
        let processing = MessageProcessingState::new(true);
        let account = Arc::new(FakeAccount {
            registered: AtomicBool::new(true),
            has_pni: AtomicBool::new(true),
        });
        let app = Arc::new(FakeApp {
            active: AtomicBool::new(true),
        });
        let pni_flag = PniIdentityKeyIssueFlag::new(db.clone());
        let clock = Arc::new(ManualClock::new(START));

        let context = PreKeyContext {
            db: db.clone(),
            service: service.clone(),
            message_processor: Arc::new(processing.clone()),
            account: account.clone(),
            app: app.clone(),
            pni_key_manager: Arc::new(pni_flag.clone()),
            clock: clock.clone(),
            config,
        };

        Self {
            db,
            service,
            processing,
            account,
            app,
            pni_flag,
            clock,
            context,
        }
    }
}

/// Default policy with small batches so ML-KEM generation stays quick.
pub fn small_config() -> PreKeyConfig {
    PreKeyConfig {
        one_time_batch_size: 5,
        pq_one_time_batch_size: 3,
        ..PreKeyConfig::default()
    }
}
