//! Failover manager settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{parse_value, unknown_key, StrataConfig};
use crate::errors::{Result, StrataError};
use crate::upgrade_domains::UpgradeDomainSortPolicy;

/// Failover manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// How long a node waits before re-sending an unanswered message
    pub fm_message_retry_interval_ms: u64,
    /// Retry tick for work blocked on the store or a missing failover unit
    pub store_retry_interval_ms: u64,
    /// Lower bound for a replica-up batch deadline
    pub min_replica_up_timeout_ms: u64,
    /// Subtracted from the message retry interval to get the batch deadline
    pub replica_up_timeout_slack_ms: u64,
    /// Time a single node is expected to take to upgrade
    pub expected_node_fabric_upgrade_duration_ms: u64,
    /// Whether node-up is rejected for nodes on the wrong version
    pub fabric_upgrade_gatekeeping_enabled: bool,
    /// Interval of the background upgrade scan
    pub periodic_state_scan_interval_ms: u64,
    /// Sort `UD10` after `UD9`
    pub sort_upgrade_domain_names_as_numbers: bool,
    /// Reconfiguration taking longer than this is reported stuck
    pub reconfiguration_time_limit_ms: u64,
    /// Placement taking longer than this is reported stuck
    pub placement_time_limit_ms: u64,
    /// Replicas listed in an unhealthy failover unit description
    pub max_replicas_in_health_report_description: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            fm_message_retry_interval_ms: 30_000,
            store_retry_interval_ms: 1_000,
            min_replica_up_timeout_ms: 5_000,
            replica_up_timeout_slack_ms: 5_000,
            expected_node_fabric_upgrade_duration_ms: 30 * 60 * 1_000,
            fabric_upgrade_gatekeeping_enabled: true,
            periodic_state_scan_interval_ms: 5_000,
            sort_upgrade_domain_names_as_numbers: true,
            reconfiguration_time_limit_ms: 300_000,
            placement_time_limit_ms: 600_000,
            max_replicas_in_health_report_description: 3,
        }
    }
}

impl FailoverConfig {
    /// Message retry interval
    pub fn fm_message_retry_interval(&self) -> Duration {
        Duration::from_millis(self.fm_message_retry_interval_ms)
    }

    /// Store retry tick
    pub fn store_retry_interval(&self) -> Duration {
        Duration::from_millis(self.store_retry_interval_ms)
    }

    /// Deadline for one replica-up batch: `max(retry - slack, min)`
    pub fn replica_up_timeout(&self) -> Duration {
        self.fm_message_retry_interval()
            .saturating_sub(Duration::from_millis(self.replica_up_timeout_slack_ms))
            .max(Duration::from_millis(self.min_replica_up_timeout_ms))
    }

    /// Expected single node upgrade duration
    pub fn expected_node_fabric_upgrade_duration(&self) -> Duration {
        Duration::from_millis(self.expected_node_fabric_upgrade_duration_ms)
    }

    /// Background scan interval
    pub fn periodic_state_scan_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_state_scan_interval_ms)
    }

    /// Reconfiguration stuck threshold
    pub fn reconfiguration_time_limit(&self) -> Duration {
        Duration::from_millis(self.reconfiguration_time_limit_ms)
    }

    /// Placement stuck threshold
    pub fn placement_time_limit(&self) -> Duration {
        Duration::from_millis(self.placement_time_limit_ms)
    }

    /// Upgrade domain ordering
    pub fn upgrade_domain_sort_policy(&self) -> UpgradeDomainSortPolicy {
        UpgradeDomainSortPolicy::from_config(self.sort_upgrade_domain_names_as_numbers)
    }
}

impl StrataConfig for FailoverConfig {
    const ENV_PREFIX: &'static str = "STRATA_FM_";

    fn merge_with(&mut self, other: &Self) {
        let defaults = Self::default();
        overlay!(
            self,
            other,
            defaults,
            [
                fm_message_retry_interval_ms,
                store_retry_interval_ms,
                min_replica_up_timeout_ms,
                replica_up_timeout_slack_ms,
                expected_node_fabric_upgrade_duration_ms,
                fabric_upgrade_gatekeeping_enabled,
                periodic_state_scan_interval_ms,
                sort_upgrade_domain_names_as_numbers,
                reconfiguration_time_limit_ms,
                placement_time_limit_ms,
                max_replicas_in_health_report_description,
            ]
        );
    }

    fn validate(&self) -> Result<()> {
        if self.fm_message_retry_interval_ms == 0 {
            return Err(StrataError::invalid(
                "fm_message_retry_interval_ms must be positive",
            ));
        }
        if self.store_retry_interval_ms == 0 {
            return Err(StrataError::invalid("store_retry_interval_ms must be positive"));
        }
        if self.store_retry_interval_ms >= self.replica_up_timeout().as_millis() as u64 {
            return Err(StrataError::invalid(
                "store_retry_interval_ms must be shorter than the replica-up deadline",
            ));
        }
        if self.periodic_state_scan_interval_ms == 0 {
            return Err(StrataError::invalid(
                "periodic_state_scan_interval_ms must be positive",
            ));
        }
        Ok(())
    }

    fn set_from_string(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "fm_message_retry_interval_ms" => {
                self.fm_message_retry_interval_ms = parse_value(key, value)?;
            }
            "store_retry_interval_ms" => self.store_retry_interval_ms = parse_value(key, value)?,
            "min_replica_up_timeout_ms" => {
                self.min_replica_up_timeout_ms = parse_value(key, value)?;
            }
            "replica_up_timeout_slack_ms" => {
                self.replica_up_timeout_slack_ms = parse_value(key, value)?;
            }
            "expected_node_fabric_upgrade_duration_ms" => {
                self.expected_node_fabric_upgrade_duration_ms = parse_value(key, value)?;
            }
            "fabric_upgrade_gatekeeping_enabled" => {
                self.fabric_upgrade_gatekeeping_enabled = parse_value(key, value)?;
            }
            "periodic_state_scan_interval_ms" => {
                self.periodic_state_scan_interval_ms = parse_value(key, value)?;
            }
            "sort_upgrade_domain_names_as_numbers" => {
                self.sort_upgrade_domain_names_as_numbers = parse_value(key, value)?;
            }
            "reconfiguration_time_limit_ms" => {
                self.reconfiguration_time_limit_ms = parse_value(key, value)?;
            }
            "placement_time_limit_ms" => self.placement_time_limit_ms = parse_value(key, value)?,
            "max_replicas_in_health_report_description" => {
                self.max_replicas_in_health_report_description = parse_value(key, value)?;
            }
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }
}
