use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use kindling_crypto::Identity;
use reqwest::{Client, RequestBuilder, Response};

use crate::entities::{PreKeyCounts, SetKeysRequest};
use crate::error::ServiceError;

/// Basic-auth credentials for the chat service.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Which credentials an authenticated request carries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChatServiceAuth {
    /// The client's configured credentials.
    #[default]
    Implicit,
    /// Explicit credentials, used during registration before any are stored.
    Explicit(ServiceCredentials),
}

/// The account endpoints the pre-key manager needs.
#[async_trait]
pub trait AccountServiceClient: Send + Sync {
    /// `GET /v2/keys`: one-time keys the server still holds for `identity`.
    async fn get_pre_key_counts(&self, identity: Identity) -> Result<PreKeyCounts, ServiceError>;

    /// `PUT /v2/keys`: replace the server's keys of each kind present in `request`.
    async fn set_pre_keys(
        &self,
        identity: Identity,
        request: &SetKeysRequest,
        auth: &ChatServiceAuth,
    ) -> Result<(), ServiceError>;
}

/// [`AccountServiceClient`] over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpAccountServiceClient {
    http: Client,
    base_url: String,
    credentials: Option<ServiceCredentials>,
}

impl HttpAccountServiceClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Option<ServiceCredentials>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InvalidRequest(format!("failed to build HTTP client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ServiceError::InvalidRequest("empty service base URL".into()));
        }
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    fn keys_url(&self) -> String {
        format!("{}/v2/keys", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder, auth: &ChatServiceAuth) -> RequestBuilder {
        let credentials = match auth {
            ChatServiceAuth::Implicit => self.credentials.as_ref(),
            ChatServiceAuth::Explicit(credentials) => Some(credentials),
        };
        match credentials {
            Some(c) => request.basic_auth(&c.username, Some(&c.password)),
            None => request,
        }
    }
}

/// Turn a non-2xx response into [`ServiceError::Http`], keeping the body as the message.
async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(256)
        .collect::<String>();
    Err(ServiceError::Http {
        status: status.as_u16(),
        message: if message.is_empty() {
            status.to_string()
        } else {
            message
        },
    })
}

#[async_trait]
impl AccountServiceClient for HttpAccountServiceClient {
    async fn get_pre_key_counts(&self, identity: Identity) -> Result<PreKeyCounts, ServiceError> {
        let request = self
            .http
            .get(self.keys_url())
            .query(&[("identity", identity.as_str())]);
        let response = self
            .authorize(request, &ChatServiceAuth::Implicit)
            .send()
            .await?;
        let counts: PreKeyCounts = check_status(response).await?.json().await?;
        tracing::debug!(%identity, ec = counts.ec, pq = counts.pq, "fetched pre-key counts");
        Ok(counts)
    }

    async fn set_pre_keys(
        &self,
        identity: Identity,
        request: &SetKeysRequest,
        auth: &ChatServiceAuth,
    ) -> Result<(), ServiceError> {
        let builder = self
            .http
            .put(self.keys_url())
            .query(&[("identity", identity.as_str())])
            .json(request);
        let response = self.authorize(builder, auth).send().await?;
        check_status(response).await?;
        tracing::debug!(
            %identity,
            signed = request.signed_pre_key.is_some(),
            one_time = request.pre_keys.as_ref().map_or(0, Vec::len),
            last_resort = request.pq_last_resort_pre_key.is_some(),
            pq_one_time = request.pq_pre_keys.as_ref().map_or(0, Vec::len),
            "uploaded pre-keys"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let client =
            HttpAccountServiceClient::new("https://chat.example/", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(client.keys_url(), "https://chat.example/v2/keys");
    }

    #[test]
    fn empty_base_url_rejected() {
        assert!(HttpAccountServiceClient::new("/", None, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = ServiceCredentials {
            username: "alice.1".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("alice.1"));
        assert!(!rendered.contains("hunter2"));
    }
}
