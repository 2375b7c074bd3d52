// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for stratus-taskmanager.
//!
//! All values come from `STRATUS_*` environment variables (after `.env` is
//! loaded by the binary) and fall back to the defaults in [`Config::default`].
//! Per-datastore sections start from the static datastore registry and can be
//! overridden with `STRATUS_<MANAGER>_*` variables, e.g.
//! `STRATUS_MYSQL_USAGE_TIMEOUT=900`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::error;

use crate::datastore::DatastoreManager;

/// Service id reported for datastores without a configured billing id.
pub const UNKNOWN_SERVICE_ID: &str = "unknown-service-id";

/// How compute and volume resources are provisioned for a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStrategy {
    /// One orchestration stack creates server and volume.
    Heat,
    /// One compute call creates the server with its volume.
    ServerVolume,
    /// The volume is created first, then the server boots with it mapped.
    Individual,
}

/// Settings for one datastore manager.
#[derive(Debug, Clone, PartialEq)]
pub struct DatastoreConfig {
    /// TCP ports or port ranges (`"3306"`, `"1000-2000"`) opened in the security group.
    pub tcp_ports: Vec<String>,
    /// UDP ports or port ranges opened in the security group.
    pub udp_ports: Vec<String>,
    /// Where the guest mounts the data volume.
    pub mount_point: String,
    /// How long creation waits for the service to report running.
    pub usage_timeout: Duration,
    /// Whether this datastore gets a data volume.
    pub volume_support: bool,
    /// Device path of the data volume, when it has one.
    pub device_path: Option<String>,
}

/// Task manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Volume create/attach/detach/extend wait.
    pub volume_time_out: Duration,
    /// Wait for the server to get an address before DNS registration.
    pub dns_time_out: Duration,
    /// Wait for a resize/migrate to leave `RESIZE` and for the datastore to follow.
    pub resize_time_out: Duration,
    /// Wait for a reverted server to return to `ACTIVE`.
    pub revert_time_out: Duration,
    /// Wait for an orchestration stack to converge.
    pub heat_time_out: Duration,
    /// Wait for a rebooted server to return to `ACTIVE`.
    pub reboot_time_out: Duration,
    /// Wait for a deleted server to disappear.
    pub server_delete_time_out: Duration,
    /// Interval between service activation and stack checks.
    pub usage_sleep_time: Duration,
    /// Interval between server, volume and service status checks.
    pub poll_interval: Duration,
    /// Interval between address checks before DNS registration.
    pub dns_poll_interval: Duration,
    /// Timeout for quick guest calls.
    pub agent_call_low_timeout: Duration,
    /// Timeout for slow guest calls.
    pub agent_call_high_timeout: Duration,
    /// Provision data volumes.
    pub volume_support: bool,
    /// Register DNS entries for new instances.
    pub dns_support: bool,
    /// Create a security group per instance.
    pub security_groups_support: bool,
    /// Provision through orchestration stacks.
    pub use_heat: bool,
    /// Create server and volume in one compute call.
    pub use_nova_server_volume: bool,
    /// Flag instances whose guest never becomes active.
    pub update_status_on_fail: bool,
    /// Device path of the data volume inside the server.
    pub device_path: String,
    /// Block device mapping key used when booting with a volume.
    pub block_device_mapping: String,
    /// CIDR allowed by security group rules.
    pub security_group_rule_cidr: String,
    /// Region reported in usage events.
    pub region: String,
    /// Publisher id of usage events.
    pub host: String,
    /// Object store container holding backups.
    pub backup_swift_container: String,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Per-datastore sections.
    pub datastores: HashMap<DatastoreManager, DatastoreConfig>,
    /// Billing service id per datastore manager.
    pub notification_service_id: HashMap<DatastoreManager, String>,
}

impl Default for Config {
    fn default() -> Self {
        let datastores = DatastoreManager::ALL
            .iter()
            .map(|m| (*m, m.profile().defaults()))
            .collect();

        let notification_service_id = [
            (DatastoreManager::Mysql, "2f3ff068-2bfb-4f70-9a9d-a6bb65bc084b"),
            (DatastoreManager::Redis, "b216ffc5-1947-456c-a4cf-70f94c05f7d0"),
            (DatastoreManager::Cassandra, "459a230d-4e97-4344-9067-2a54a310b0ed"),
            (DatastoreManager::Couchbase, "fa62fe68-74d9-4779-a24e-36f19602c415"),
            (DatastoreManager::Mongodb, "c8c907af-7375-456f-b929-b637ff9209ee"),
            (DatastoreManager::Postgresql, "ac277e0d-4f21-40aa-b347-1ea31e571720"),
        ]
        .into_iter()
        .map(|(m, id)| (m, id.to_string()))
        .collect();

        Self {
            volume_time_out: Duration::from_secs(60),
            dns_time_out: Duration::from_secs(120),
            resize_time_out: Duration::from_secs(600),
            revert_time_out: Duration::from_secs(600),
            heat_time_out: Duration::from_secs(60),
            reboot_time_out: Duration::from_secs(120),
            server_delete_time_out: Duration::from_secs(60),
            usage_sleep_time: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            dns_poll_interval: Duration::from_secs(1),
            agent_call_low_timeout: Duration::from_secs(5),
            agent_call_high_timeout: Duration::from_secs(60),
            volume_support: true,
            dns_support: false,
            security_groups_support: true,
            use_heat: false,
            use_nova_server_volume: false,
            update_status_on_fail: true,
            device_path: "/dev/vdb".to_string(),
            block_device_mapping: "vdb".to_string(),
            security_group_rule_cidr: "0.0.0.0/0".to_string(),
            region: "LOCAL_DEV".to_string(),
            host: "0.0.0.0".to_string(),
            backup_swift_container: "database_backups".to_string(),
            database_path: PathBuf::from(".data/stratus.db"),
            datastores,
            notification_service_id,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.volume_time_out = env_secs("STRATUS_VOLUME_TIME_OUT", config.volume_time_out)?;
        config.dns_time_out = env_secs("STRATUS_DNS_TIME_OUT", config.dns_time_out)?;
        config.resize_time_out = env_secs("STRATUS_RESIZE_TIME_OUT", config.resize_time_out)?;
        config.revert_time_out = env_secs("STRATUS_REVERT_TIME_OUT", config.revert_time_out)?;
        config.heat_time_out = env_secs("STRATUS_HEAT_TIME_OUT", config.heat_time_out)?;
        config.reboot_time_out = env_secs("STRATUS_REBOOT_TIME_OUT", config.reboot_time_out)?;
        config.server_delete_time_out =
            env_secs("STRATUS_SERVER_DELETE_TIME_OUT", config.server_delete_time_out)?;
        config.usage_sleep_time = env_secs("STRATUS_USAGE_SLEEP_TIME", config.usage_sleep_time)?;
        config.poll_interval = env_secs("STRATUS_POLL_INTERVAL", config.poll_interval)?;
        config.dns_poll_interval =
            env_secs("STRATUS_DNS_POLL_INTERVAL", config.dns_poll_interval)?;
        config.agent_call_low_timeout =
            env_secs("STRATUS_AGENT_CALL_LOW_TIMEOUT", config.agent_call_low_timeout)?;
        config.agent_call_high_timeout =
            env_secs("STRATUS_AGENT_CALL_HIGH_TIMEOUT", config.agent_call_high_timeout)?;

        config.volume_support = env_bool("STRATUS_VOLUME_SUPPORT", config.volume_support)?;
        config.dns_support = env_bool("STRATUS_DNS_SUPPORT", config.dns_support)?;
        config.security_groups_support =
            env_bool("STRATUS_SECURITY_GROUPS_SUPPORT", config.security_groups_support)?;
        config.use_heat = env_bool("STRATUS_USE_HEAT", config.use_heat)?;
        config.use_nova_server_volume =
            env_bool("STRATUS_USE_NOVA_SERVER_VOLUME", config.use_nova_server_volume)?;
        config.update_status_on_fail =
            env_bool("STRATUS_UPDATE_STATUS_ON_FAIL", config.update_status_on_fail)?;

        config.device_path = env_string("STRATUS_DEVICE_PATH", config.device_path);
        config.block_device_mapping =
            env_string("STRATUS_BLOCK_DEVICE_MAPPING", config.block_device_mapping);
        config.security_group_rule_cidr =
            env_string("STRATUS_SECURITY_GROUP_RULE_CIDR", config.security_group_rule_cidr);
        config.region = env_string("STRATUS_REGION", config.region);
        config.host = env_string("STRATUS_HOST", config.host);
        config.backup_swift_container =
            env_string("STRATUS_BACKUP_SWIFT_CONTAINER", config.backup_swift_container);
        if let Ok(path) = std::env::var("STRATUS_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        for manager in DatastoreManager::ALL {
            let prefix = format!("STRATUS_{}", manager.as_str().to_uppercase());
            if let Some(section) = config.datastores.get_mut(&manager) {
                section.apply_env(&prefix)?;
            }
            if let Ok(id) = std::env::var(format!("{}_SERVICE_ID", prefix)) {
                config.notification_service_id.insert(manager, id);
            }
        }

        Ok(config)
    }

    /// Provisioning strategy selected by the `use_heat` and
    /// `use_nova_server_volume` flags. Heat wins when both are set.
    pub fn provisioning_strategy(&self) -> ProvisioningStrategy {
        if self.use_heat {
            ProvisioningStrategy::Heat
        } else if self.use_nova_server_volume {
            ProvisioningStrategy::ServerVolume
        } else {
            ProvisioningStrategy::Individual
        }
    }

    /// Section for a datastore manager, falling back to registry defaults.
    pub fn datastore(&self, manager: DatastoreManager) -> DatastoreConfig {
        self.datastores
            .get(&manager)
            .cloned()
            .unwrap_or_else(|| manager.profile().defaults())
    }

    /// Billing service id for a datastore manager.
    pub fn service_id(&self, manager: DatastoreManager) -> String {
        match self.notification_service_id.get(&manager) {
            Some(id) => id.clone(),
            None => {
                error!(
                    datastore_manager = %manager,
                    "Datastore ID for manager is not configured"
                );
                UNKNOWN_SERVICE_ID.to_string()
            }
        }
    }
}

impl DatastoreConfig {
    fn apply_env(&mut self, prefix: &str) -> Result<(), ConfigError> {
        if let Ok(ports) = std::env::var(format!("{}_TCP_PORTS", prefix)) {
            self.tcp_ports = split_list(&ports);
        }
        if let Ok(ports) = std::env::var(format!("{}_UDP_PORTS", prefix)) {
            self.udp_ports = split_list(&ports);
        }
        if let Ok(mount_point) = std::env::var(format!("{}_MOUNT_POINT", prefix)) {
            self.mount_point = mount_point;
        }
        self.usage_timeout = env_secs(&format!("{}_USAGE_TIMEOUT", prefix), self.usage_timeout)?;
        self.volume_support = env_bool(&format!("{}_VOLUME_SUPPORT", prefix), self.volume_support)?;
        if let Ok(device_path) = std::env::var(format!("{}_DEVICE_PATH", prefix)) {
            self.device_path = Some(device_path);
        }
        Ok(())
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(value) => u64::from_str(value.trim())
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name: name.to_string(),
                value,
            }),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be parsed.
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue {
        /// Variable name.
        name: String,
        /// Offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.resize_time_out, Duration::from_secs(600));
        assert_eq!(config.usage_sleep_time, Duration::from_secs(5));
        assert!(config.volume_support);
        assert!(!config.dns_support);
        assert_eq!(config.device_path, "/dev/vdb");
        assert_eq!(
            config.provisioning_strategy(),
            ProvisioningStrategy::Individual
        );
    }

    #[test]
    fn test_heat_wins_over_server_volume() {
        let config = Config {
            use_heat: true,
            use_nova_server_volume: true,
            ..Config::default()
        };
        assert_eq!(config.provisioning_strategy(), ProvisioningStrategy::Heat);

        let config = Config {
            use_nova_server_volume: true,
            ..Config::default()
        };
        assert_eq!(
            config.provisioning_strategy(),
            ProvisioningStrategy::ServerVolume
        );
    }

    #[test]
    fn test_datastore_sections() {
        let config = Config::default();
        let mysql = config.datastore(DatastoreManager::Mysql);
        assert_eq!(mysql.tcp_ports, vec!["3306".to_string()]);
        assert_eq!(mysql.mount_point, "/var/lib/mysql");
        assert_eq!(mysql.usage_timeout, Duration::from_secs(400));

        let redis = config.datastore(DatastoreManager::Redis);
        assert!(!redis.volume_support);
        assert_eq!(redis.usage_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_unknown_service_id() {
        let config = Config::default();
        assert_eq!(
            config.service_id(DatastoreManager::Mysql),
            "2f3ff068-2bfb-4f70-9a9d-a6bb65bc084b"
        );
        assert_eq!(
            config.service_id(DatastoreManager::Percona),
            UNKNOWN_SERVICE_ID
        );
    }

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list("3306, 1000-2000,,"),
            vec!["3306".to_string(), "1000-2000".to_string()]
        );
    }
}
