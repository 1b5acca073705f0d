//! Tunables for pre-key generation, refresh and health checks.

use std::path::Path;
use std::time::Duration;

use kindling_store::RetentionPolicy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreKeyConfig {
    /// EC one-time pre-keys generated per batch.
    pub one_time_batch_size: u32,

    /// ML-KEM one-time pre-keys generated per batch.
    pub pq_one_time_batch_size: u32,

    /// Refresh replenishes EC one-time keys when the server holds fewer.
    pub ec_minimum_count: u32,

    /// Refresh replenishes ML-KEM one-time keys when the server holds fewer.
    pub pq_minimum_count: u32,

    #[serde(with = "humantime_serde")]
    pub signed_rotation_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub last_resort_rotation_interval: Duration,

    /// Minimum time between two successful periodic checks.
    #[serde(with = "humantime_serde")]
    pub check_throttle: Duration,

    /// How long to wait on message processing before re-checking cancellation.
    #[serde(with = "humantime_serde")]
    pub message_processing_recheck: Duration,

    pub app_lock_failure_count: u32,

    #[serde(with = "humantime_serde")]
    pub app_lock_failure_duration: Duration,

    /// A last successful rotation older than this locks the app.
    #[serde(with = "humantime_serde")]
    pub rotation_staleness: Duration,

    #[serde(with = "humantime_serde")]
    pub signed_retention: Duration,

    pub min_retained_signed: usize,

    #[serde(with = "humantime_serde")]
    pub one_time_retention: Duration,

    /// Include ML-KEM targets in refresh and rotation.
    pub enable_pq_pre_keys: bool,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            one_time_batch_size: 100,
            pq_one_time_batch_size: 100,
            ec_minimum_count: 10,
            pq_minimum_count: 10,
            signed_rotation_interval: DAY * 2,
            last_resort_rotation_interval: DAY * 2,
            check_throttle: HOUR * 12,
            message_processing_recheck: Duration::from_secs(3),
            app_lock_failure_count: 5,
            app_lock_failure_duration: DAY * 10,
            rotation_staleness: DAY * 14,
            signed_retention: DAY * 30,
            min_retained_signed: 3,
            one_time_retention: DAY * 90,
            enable_pq_pre_keys: true,
        }
    }
}

impl PreKeyConfig {
    /// Load from a TOML file containing just this table.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.one_time_batch_size == 0 || self.pq_one_time_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "one-time batch sizes must be greater than 0".to_string(),
            ));
        }
        if self.message_processing_recheck.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "message_processing_recheck must be greater than 0".to_string(),
            ));
        }
        if self.app_lock_failure_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "app_lock_failure_count must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            signed_retention: self.signed_retention,
            min_retained_signed: self.min_retained_signed,
            one_time_retention: self.one_time_retention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PreKeyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retention_policy(), RetentionPolicy::default());
    }

    #[test]
    fn parses_humantime_durations() {
        let config: PreKeyConfig = toml::from_str(
            r#"
            check_throttle = "6h"
            signed_rotation_interval = "1day"
            enable_pq_pre_keys = false
            "#,
        )
        .unwrap();
        assert_eq!(config.check_throttle, HOUR * 6);
        assert_eq!(config.signed_rotation_interval, DAY);
        assert!(!config.enable_pq_pre_keys);
        assert_eq!(config.one_time_batch_size, 100);
    }

    #[test]
    fn rejects_zero_values() {
        let config = PreKeyConfig {
            one_time_batch_size: 0,
            ..PreKeyConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PreKeyConfig {
            message_processing_recheck: Duration::ZERO,
            ..PreKeyConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PreKeyConfig {
            app_lock_failure_count: 0,
            ..PreKeyConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
