//! Daemon configuration: a TOML file, then `KINDLING_*` environment
//! overrides, then command-line flags.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kindling_prekeys::{ConfigError, PreKeyConfig};
use kindling_service::ServiceCredentials;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// How often the pre-key health check runs. The check itself is
    /// throttled by `pre_keys.check_throttle`.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    pub pre_keys: PreKeyConfig,
    pub service: ServiceConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60 * 60),
            pre_keys: PreKeyConfig::default(),
            service: ServiceConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            username: None,
            password: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: dirs_fallback("kindling/keys.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn dirs_fallback(subpath: &str) -> PathBuf {
    let base = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{base}/.local/share/{subpath}"))
}

impl ServiceConfig {
    /// Basic-auth credentials, when both halves are configured.
    pub fn credentials(&self) -> Option<ServiceCredentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(ServiceCredentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file. Not validated; call [`DaemonConfig::validate`]
    /// once all overrides are applied.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Defaults with environment overrides applied, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Apply `KINDLING_*` overrides looked up through `var`.
    pub fn apply_overrides(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = var("KINDLING_SERVICE_URL") {
            self.service.base_url = url;
        }
        if let Some(username) = var("KINDLING_SERVICE_USERNAME") {
            self.service.username = Some(username);
        }
        if let Some(password) = var("KINDLING_SERVICE_PASSWORD") {
            self.service.password = Some(password);
        }
        if let Some(timeout) = var("KINDLING_SERVICE_TIMEOUT") {
            self.service.request_timeout = parse_duration("KINDLING_SERVICE_TIMEOUT", &timeout)?;
        }
        if let Some(path) = var("KINDLING_DB_PATH") {
            self.store.database_path = PathBuf::from(path);
        }
        if let Some(level) = var("KINDLING_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = var("KINDLING_LOG_JSON") {
            self.logging.json = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid KINDLING_LOG_JSON: {e}")))?;
        }
        if let Some(interval) = var("KINDLING_CHECK_INTERVAL") {
            self.check_interval = parse_duration("KINDLING_CHECK_INTERVAL", &interval)?;
        }
        if let Some(enabled) = var("KINDLING_ENABLE_PQ_PRE_KEYS") {
            self.pre_keys.enable_pq_pre_keys = enabled.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid KINDLING_ENABLE_PQ_PRE_KEYS: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.service.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::ValidationFailed(format!(
                "service.base_url must be an http(s) URL, got {url:?}"
            )));
        }
        if self.service.username.is_some() != self.service.password.is_some() {
            return Err(ConfigError::ValidationFailed(
                "service.username and service.password must be set together".to_string(),
            ));
        }
        if self.service.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "service.request_timeout must be greater than 0".to_string(),
            ));
        }
        if self.check_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "check_interval must be greater than 0".to_string(),
            ));
        }
        if self.store.database_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "store.database_path must not be empty".to_string(),
            ));
        }
        self.pre_keys.validate()
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value)
        .map_err(|e| ConfigError::InvalidValue(format!("Invalid {key}: {e}")))
}
