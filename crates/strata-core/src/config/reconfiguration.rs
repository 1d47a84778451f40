//! Reconfiguration agent settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{parse_value, unknown_key, StrataConfig};
use crate::errors::{Result, StrataError};

/// Reconfiguration agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconfigurationConfig {
    /// Wait before retrying a failed package download
    pub fabric_upgrade_download_retry_interval_ms: u64,
    /// Wait before retrying a failed validation
    pub fabric_upgrade_validate_retry_interval_ms: u64,
    /// Wait before retrying a failed upgrade
    pub fabric_upgrade_upgrade_retry_interval_ms: u64,
}

impl Default for ReconfigurationConfig {
    fn default() -> Self {
        Self {
            fabric_upgrade_download_retry_interval_ms: 5_000,
            fabric_upgrade_validate_retry_interval_ms: 5_000,
            fabric_upgrade_upgrade_retry_interval_ms: 5_000,
        }
    }
}

impl ReconfigurationConfig {
    /// Download retry interval
    pub fn fabric_upgrade_download_retry_interval(&self) -> Duration {
        Duration::from_millis(self.fabric_upgrade_download_retry_interval_ms)
    }

    /// Validation retry interval
    pub fn fabric_upgrade_validate_retry_interval(&self) -> Duration {
        Duration::from_millis(self.fabric_upgrade_validate_retry_interval_ms)
    }

    /// Upgrade retry interval
    pub fn fabric_upgrade_upgrade_retry_interval(&self) -> Duration {
        Duration::from_millis(self.fabric_upgrade_upgrade_retry_interval_ms)
    }
}

impl StrataConfig for ReconfigurationConfig {
    const ENV_PREFIX: &'static str = "STRATA_RA_";

    fn merge_with(&mut self, other: &Self) {
        let defaults = Self::default();
        overlay!(
            self,
            other,
            defaults,
            [
                fabric_upgrade_download_retry_interval_ms,
                fabric_upgrade_validate_retry_interval_ms,
                fabric_upgrade_upgrade_retry_interval_ms,
            ]
        );
    }

    fn validate(&self) -> Result<()> {
        let intervals = [
            self.fabric_upgrade_download_retry_interval_ms,
            self.fabric_upgrade_validate_retry_interval_ms,
            self.fabric_upgrade_upgrade_retry_interval_ms,
        ];
        if intervals.contains(&0) {
            return Err(StrataError::invalid("retry intervals must be positive"));
        }
        Ok(())
    }

    fn set_from_string(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "fabric_upgrade_download_retry_interval_ms" => {
                self.fabric_upgrade_download_retry_interval_ms = parse_value(key, value)?;
            }
            "fabric_upgrade_validate_retry_interval_ms" => {
                self.fabric_upgrade_validate_retry_interval_ms = parse_value(key, value)?;
            }
            "fabric_upgrade_upgrade_retry_interval_ms" => {
                self.fabric_upgrade_upgrade_retry_interval_ms = parse_value(key, value)?;
            }
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }
}
