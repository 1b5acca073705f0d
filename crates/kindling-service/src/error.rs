use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ServiceError {
    /// The HTTP status, when the server answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ServiceError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the request never got a response (connect, timeout, reset).
    pub fn is_network_failure(&self) -> bool {
        matches!(self, ServiceError::Network(_))
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            ServiceError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_decode() {
            ServiceError::Decode(e.to_string())
        } else if e.is_builder() {
            ServiceError::InvalidRequest(e.to_string())
        } else {
            ServiceError::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let forbidden = ServiceError::Http {
            status: 403,
            message: "forbidden".into(),
        };
        assert_eq!(forbidden.status_code(), Some(403));
        assert!(!forbidden.is_network_failure());

        let offline = ServiceError::Network("connection refused".into());
        assert_eq!(offline.status_code(), None);
        assert!(offline.is_network_failure());
    }
}
