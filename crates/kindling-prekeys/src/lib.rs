//! Pre-key lifecycle management: generation, upload, rotation, culling and
//! the health signals derived from them.

pub mod action;
pub mod bundle;
pub mod config;
pub mod context;
pub mod error;
pub mod generator;
pub mod manager;
pub mod queue;
pub mod target;
pub mod task_manager;
pub mod uploader;

pub use action::PreKeyAction;
pub use bundle::{
    PartialPreKeyUploadBundle, PreKeyUploadBundle, RegistrationPreKeyUploadBundle,
    RegistrationPreKeyUploadBundles,
};
pub use config::PreKeyConfig;
pub use context::{
    AccountState, AppLifecycle, Clock, LinkedDevicePniKeyManager, ManualClock,
    MessageProcessingState, MessageProcessor, PniIdentityKeyIssueFlag, PreKeyContext, SystemClock,
};
pub use error::{ConfigError, PreKeyError};
pub use generator::KeyGenerator;
pub use manager::PreKeyManager;
pub use queue::OperationQueue;
pub use target::{PreKeyTarget, Targets};
pub use task_manager::PreKeyTaskManager;
pub use uploader::{BundleUploader, UploadResult};
