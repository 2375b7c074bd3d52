// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Static datastore registry.
//!
//! Each [`DatastoreManager`] maps to one [`DatastoreProfile`] known at compile
//! time. The profile supplies the default configuration section, renders the
//! datastore's configuration file for a flavor, renders user overrides, and
//! decides which override keys need a restart.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clients::Flavor;
use crate::config::DatastoreConfig;

const DEFAULT_USAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// Datastore managers the task manager knows how to provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreManager {
    /// MySQL.
    Mysql,
    /// Percona Server.
    Percona,
    /// Redis.
    Redis,
    /// Apache Cassandra.
    Cassandra,
    /// Couchbase.
    Couchbase,
    /// MongoDB.
    Mongodb,
    /// PostgreSQL.
    Postgresql,
}

impl DatastoreManager {
    /// Every known manager.
    pub const ALL: [DatastoreManager; 7] = [
        Self::Mysql,
        Self::Percona,
        Self::Redis,
        Self::Cassandra,
        Self::Couchbase,
        Self::Mongodb,
        Self::Postgresql,
    ];

    /// Manager name as stored on instance records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Percona => "percona",
            Self::Redis => "redis",
            Self::Cassandra => "cassandra",
            Self::Couchbase => "couchbase",
            Self::Mongodb => "mongodb",
            Self::Postgresql => "postgresql",
        }
    }

    /// Capability implementation for this manager.
    pub fn profile(&self) -> &'static dyn DatastoreProfile {
        match self {
            Self::Mysql => &MYSQL,
            Self::Percona => &PERCONA,
            Self::Redis => &REDIS,
            Self::Cassandra => &CASSANDRA,
            Self::Couchbase => &COUCHBASE,
            Self::Mongodb => &MONGODB,
            Self::Postgresql => &POSTGRESQL,
        }
    }
}

impl fmt::Display for DatastoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown manager name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown datastore manager: {0}")]
pub struct UnknownDatastoreManager(pub String);

impl FromStr for DatastoreManager {
    type Err = UnknownDatastoreManager;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownDatastoreManager(s.to_string()))
    }
}

/// What the task manager needs to know about a datastore.
pub trait DatastoreProfile: Send + Sync {
    /// The manager this profile belongs to.
    fn manager(&self) -> DatastoreManager;

    /// Default configuration section.
    fn defaults(&self) -> DatastoreConfig;

    /// Render the datastore configuration file for a flavor.
    fn render_config(&self, flavor: &Flavor) -> String;

    /// Render user overrides in the datastore's configuration syntax.
    fn render_overrides(&self, overrides: &BTreeMap<String, Value>) -> String;

    /// Whether changing `key` only takes effect after a restart.
    fn requires_restart(&self, key: &str) -> bool;

    /// Backup strategy used by the guest, if the datastore supports backups.
    fn backup_strategy(&self) -> Option<&'static str> {
        None
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn ports(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| p.to_string()).collect()
}

struct MysqlProfile {
    manager: DatastoreManager,
    usage_timeout: Duration,
}

static MYSQL: MysqlProfile = MysqlProfile {
    manager: DatastoreManager::Mysql,
    usage_timeout: Duration::from_secs(400),
};

static PERCONA: MysqlProfile = MysqlProfile {
    manager: DatastoreManager::Percona,
    usage_timeout: Duration::from_secs(450),
};

/// mysqld variables that can be changed at runtime.
const MYSQL_DYNAMIC_KEYS: &[&str] = &[
    "autocommit",
    "connect_timeout",
    "interactive_timeout",
    "key_buffer_size",
    "local_infile",
    "max_allowed_packet",
    "max_connect_errors",
    "max_connections",
    "sort_buffer_size",
    "wait_timeout",
];

impl DatastoreProfile for MysqlProfile {
    fn manager(&self) -> DatastoreManager {
        self.manager
    }

    fn defaults(&self) -> DatastoreConfig {
        DatastoreConfig {
            tcp_ports: ports(&["3306"]),
            udp_ports: Vec::new(),
            mount_point: "/var/lib/mysql".to_string(),
            usage_timeout: self.usage_timeout,
            volume_support: true,
            device_path: Some("/dev/vdb".to_string()),
        }
    }

    fn render_config(&self, flavor: &Flavor) -> String {
        let ram = flavor.ram.max(1);
        format!(
            "[client]\nport = 3306\n\n[mysqld]\nport = 3306\ndatadir = /var/lib/mysql\n\
             max_connections = {}\ninnodb_buffer_pool_size = {}M\nkey_buffer_size = {}M\n\
             table_open_cache = {}\n",
            (ram / 2).max(100),
            (ram / 2).max(16),
            (ram / 32).max(8),
            (ram / 2).max(256),
        )
    }

    fn render_overrides(&self, overrides: &BTreeMap<String, Value>) -> String {
        let mut out = String::from("[mysqld]\n");
        for (key, value) in overrides {
            out.push_str(&format!("{} = {}\n", key, value_to_string(value)));
        }
        out
    }

    fn requires_restart(&self, key: &str) -> bool {
        !MYSQL_DYNAMIC_KEYS.contains(&key)
    }

    fn backup_strategy(&self) -> Option<&'static str> {
        Some("InnoBackupEx")
    }
}

struct RedisProfile;

static REDIS: RedisProfile = RedisProfile;

impl DatastoreProfile for RedisProfile {
    fn manager(&self) -> DatastoreManager {
        DatastoreManager::Redis
    }

    fn defaults(&self) -> DatastoreConfig {
        DatastoreConfig {
            tcp_ports: ports(&["6379"]),
            udp_ports: Vec::new(),
            mount_point: "/var/lib/redis".to_string(),
            usage_timeout: DEFAULT_USAGE_TIMEOUT,
            volume_support: false,
            device_path: None,
        }
    }

    fn render_config(&self, flavor: &Flavor) -> String {
        format!(
            "port 6379\ndir /var/lib/redis\nmaxmemory {}mb\n",
            (flavor.ram * 3 / 4).max(64)
        )
    }

    fn render_overrides(&self, overrides: &BTreeMap<String, Value>) -> String {
        overrides
            .iter()
            .map(|(k, v)| format!("{} {}\n", k, value_to_string(v)))
            .collect()
    }

    fn requires_restart(&self, key: &str) -> bool {
        matches!(key, "port" | "dir" | "databases" | "bind")
    }
}

/// Datastores configured with flat `key: value` YAML-ish files.
struct KeyValueProfile {
    manager: DatastoreManager,
    tcp_ports: &'static [&'static str],
    mount_point: &'static str,
    /// Key receiving the flavor's memory size in MB.
    memory_key: &'static str,
    separator: &'static str,
    backup_strategy: Option<&'static str>,
}

static CASSANDRA: KeyValueProfile = KeyValueProfile {
    manager: DatastoreManager::Cassandra,
    tcp_ports: &["7000", "7001", "9042", "9160"],
    mount_point: "/var/lib/cassandra",
    memory_key: "memtable_heap_space_in_mb",
    separator: ": ",
    backup_strategy: None,
};

static COUCHBASE: KeyValueProfile = KeyValueProfile {
    manager: DatastoreManager::Couchbase,
    tcp_ports: &["8091", "8092", "4369", "11209-11211", "21100-21199"],
    mount_point: "/var/lib/couchbase",
    memory_key: "ramsize_mb",
    separator: " = ",
    backup_strategy: Some("CbBackup"),
};

static MONGODB: KeyValueProfile = KeyValueProfile {
    manager: DatastoreManager::Mongodb,
    tcp_ports: &["2500", "27017"],
    mount_point: "/var/lib/mongodb",
    memory_key: "cacheSizeMB",
    separator: ": ",
    backup_strategy: None,
};

static POSTGRESQL: KeyValueProfile = KeyValueProfile {
    manager: DatastoreManager::Postgresql,
    tcp_ports: &["5432"],
    mount_point: "/var/lib/postgresql",
    memory_key: "shared_buffers_mb",
    separator: " = ",
    backup_strategy: None,
};

impl DatastoreProfile for KeyValueProfile {
    fn manager(&self) -> DatastoreManager {
        self.manager
    }

    fn defaults(&self) -> DatastoreConfig {
        DatastoreConfig {
            tcp_ports: ports(self.tcp_ports),
            udp_ports: Vec::new(),
            mount_point: self.mount_point.to_string(),
            usage_timeout: DEFAULT_USAGE_TIMEOUT,
            volume_support: true,
            device_path: Some("/dev/vdb".to_string()),
        }
    }

    fn render_config(&self, flavor: &Flavor) -> String {
        format!(
            "data_directory{sep}{dir}\n{key}{sep}{mem}\n",
            sep = self.separator,
            dir = self.mount_point,
            key = self.memory_key,
            mem = (flavor.ram / 4).max(32),
        )
    }

    fn render_overrides(&self, overrides: &BTreeMap<String, Value>) -> String {
        overrides
            .iter()
            .map(|(k, v)| format!("{}{}{}\n", k, self.separator, value_to_string(v)))
            .collect()
    }

    fn requires_restart(&self, _key: &str) -> bool {
        true
    }

    fn backup_strategy(&self) -> Option<&'static str> {
        self.backup_strategy
    }
}
