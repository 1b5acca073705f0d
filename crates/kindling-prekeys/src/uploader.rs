use std::sync::Arc;

use kindling_service::{AccountServiceClient, ChatServiceAuth, ServiceError};

use crate::bundle::PreKeyUploadBundle;

const FORBIDDEN: u16 = 403;

#[derive(Debug)]
pub enum UploadResult {
    Success,
    /// The bundle held nothing to send; no request was made.
    Skipped,
    /// HTTP 403: on a linked device this means the server holds a different
    /// identity key than ours. Only meaningful for PNI uploads.
    IncorrectIdentityKeyOnLinkedDevice,
    Failure(ServiceError),
}

/// Sends bundles to the account service and classifies the response.
#[derive(Clone)]
pub struct BundleUploader {
    client: Arc<dyn AccountServiceClient>,
}

impl BundleUploader {
    pub fn new(client: Arc<dyn AccountServiceClient>) -> Self {
        Self { client }
    }

    pub async fn upload(
        &self,
        bundle: &dyn PreKeyUploadBundle,
        auth: &ChatServiceAuth,
    ) -> UploadResult {
        if bundle.is_empty() {
            return UploadResult::Skipped;
        }

        let identity = bundle.identity();
        tracing::info!(%identity, "uploading pre-keys");
        match self
            .client
            .set_pre_keys(identity, &bundle.to_request(), auth)
            .await
        {
            Ok(()) => UploadResult::Success,
            Err(e) if e.status_code() == Some(FORBIDDEN) => {
                UploadResult::IncorrectIdentityKeyOnLinkedDevice
            }
            Err(e) => UploadResult::Failure(e),
        }
    }
}
