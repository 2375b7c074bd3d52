// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote collaborator interfaces.
//!
//! The task manager only talks to the outside world through these traits:
//! compute, block storage, DNS, object storage, security groups,
//! orchestration stacks, and the guest agent running inside each instance.
//! Each call may block for seconds and may fail; provider failures come back
//! as [`ProviderError`], guest failures as [`GuestError`].

pub mod simulated;

pub use self::simulated::{ExtendBehavior, ResizeBehavior, SimulatedCloud, SimulatedGuest};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GuestError, ProviderError};

/// Compute flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    /// Flavor id.
    pub id: String,
    /// Flavor name.
    pub name: String,
    /// Memory in MB.
    pub ram: i64,
}

/// Status reported by the compute provider for a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    /// Booting.
    Build,
    /// Running.
    Active,
    /// Resize or migration in progress.
    Resize,
    /// Resize or migration finished, waiting for confirm or revert.
    VerifyResize,
    /// Revert in progress.
    RevertResize,
    /// Rebooting.
    Reboot,
    /// Stopped.
    Shutdown,
    /// Broken.
    Error,
    /// Failed to boot.
    Failed,
    /// Anything else the provider reports.
    Other(String),
}

impl ServerStatus {
    /// Provider spelling of the status.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Build => "BUILD",
            Self::Active => "ACTIVE",
            Self::Resize => "RESIZE",
            Self::VerifyResize => "VERIFY_RESIZE",
            Self::RevertResize => "REVERT_RESIZE",
            Self::Reboot => "REBOOT",
            Self::Shutdown => "SHUTDOWN",
            Self::Error => "ERROR",
            Self::Failed => "FAILED",
            Self::Other(s) => s,
        }
    }

    /// Parse a provider status, case-insensitively.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "BUILD" => Self::Build,
            "ACTIVE" => Self::Active,
            "RESIZE" => Self::Resize,
            "VERIFY_RESIZE" => Self::VerifyResize,
            "REVERT_RESIZE" => Self::RevertResize,
            "REBOOT" => Self::Reboot,
            "SHUTDOWN" => Self::Shutdown,
            "ERROR" => Self::Error,
            "FAILED" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute server as seen by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    /// Server id.
    pub id: String,
    /// Current status.
    pub status: ServerStatus,
    /// Current flavor id.
    pub flavor_id: String,
    /// Addresses per network name.
    pub addresses: BTreeMap<String, Vec<String>>,
    /// Availability zone the server landed in.
    pub availability_zone: Option<String>,
    /// Host the server runs on.
    pub host: Option<String>,
    /// Volumes created together with the server.
    pub attached_volumes: Vec<String>,
}

impl Server {
    /// Whether the status is one of `expected`.
    pub fn status_matches(&self, expected: &[ServerStatus]) -> bool {
        expected.contains(&self.status)
    }

    /// First address of the first network, in network-name order.
    pub fn first_address(&self) -> Option<&str> {
        self.addresses
            .values()
            .flat_map(|addrs| addrs.iter())
            .map(String::as_str)
            .next()
    }
}

/// Network interface requested for a new server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Nic {
    /// Existing port to plug in.
    #[serde(rename = "port-id", default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,
    /// Network to create a port on.
    #[serde(rename = "net-id", default, skip_serializing_if = "Option::is_none")]
    pub net_id: Option<String>,
    /// Fixed IPv4 address for the new port.
    #[serde(rename = "v4-fixed-ip", default, skip_serializing_if = "Option::is_none")]
    pub v4_fixed_ip: Option<String>,
}

/// Volume created together with a server.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSpec {
    /// Size in GB.
    pub size: i64,
    /// Volume name.
    pub name: String,
    /// Volume description.
    pub description: String,
}

/// Parameters of a compute create call.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCreateRequest {
    /// Server name.
    pub name: String,
    /// Image to boot.
    pub image_id: String,
    /// Flavor to boot with.
    pub flavor_id: String,
    /// Files injected into the server, keyed by path.
    pub files: BTreeMap<String, String>,
    /// Security group names.
    pub security_groups: Vec<String>,
    /// Block device mapping, keyed by device name.
    pub block_device_mapping: Option<BTreeMap<String, String>>,
    /// Volume to create with the server.
    pub volume: Option<VolumeSpec>,
    /// Requested availability zone.
    pub availability_zone: Option<String>,
    /// Network interfaces.
    pub nics: Vec<Nic>,
}

/// Status reported by the block storage provider for a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeStatus {
    /// Being created.
    Creating,
    /// Not attached.
    Available,
    /// Being attached.
    Attaching,
    /// Attached to a server.
    InUse,
    /// Being detached.
    Detaching,
    /// Being extended.
    Extending,
    /// Broken.
    Error,
    /// Anything else the provider reports.
    Other(String),
}

impl VolumeStatus {
    /// Provider spelling of the status.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::Attaching => "attaching",
            Self::InUse => "in-use",
            Self::Detaching => "detaching",
            Self::Extending => "extending",
            Self::Error => "error",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block volume as seen by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Volume id.
    pub id: String,
    /// Current status.
    pub status: VolumeStatus,
    /// Size in GB.
    pub size: i64,
}

/// Security group created for an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityGroup {
    /// Group id.
    pub id: String,
    /// Group name, as passed to compute create.
    pub name: String,
}

/// Orchestration stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Stack {
    /// Stack id.
    pub id: String,
    /// Last action (`CREATE`, `DELETE`, ...).
    pub action: String,
    /// Status of the last action (`CREATE_COMPLETE`, `CREATE_FAILED`, ...).
    pub status: String,
}

/// Resource inside an orchestration stack.
#[derive(Debug, Clone, PartialEq)]
pub struct StackResource {
    /// Provider id of the created resource.
    pub physical_resource_id: String,
    /// Resource status (`CREATE_COMPLETE`, ...).
    pub resource_status: String,
}

/// Object listed from a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    /// Object name.
    pub name: String,
}

/// Backup handed to the guest, either to create one or to restore from one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Backup id.
    pub id: String,
    /// Object-store URL of the backup.
    #[serde(default)]
    pub location: Option<String>,
    /// Backup strategy name.
    #[serde(rename = "type", default)]
    pub backup_type: Option<String>,
    /// Checksum of the stored object.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Arguments of the guest `prepare` call.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareRequest {
    /// Flavor memory in MB.
    pub memory_mb: i64,
    /// Packages to install.
    pub packages: Vec<String>,
    /// Databases to create.
    pub databases: Vec<Value>,
    /// Users to create.
    pub users: Vec<Value>,
    /// Device path of the data volume.
    pub device_path: String,
    /// Where to mount the data volume.
    pub mount_point: String,
    /// Backup to restore from.
    pub backup_info: Option<BackupInfo>,
    /// Rendered datastore configuration.
    pub config_contents: String,
    /// Root password to set, if root is enabled on create.
    pub root_password: Option<String>,
    /// Rendered configuration overrides.
    pub overrides: Option<String>,
}

/// Compute provider.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Boot a server.
    async fn create_server(&self, request: &ServerCreateRequest) -> Result<Server, ProviderError>;
    /// Fetch a server. Missing servers are `ProviderError::NotFound`.
    async fn get_server(&self, server_id: &str) -> Result<Server, ProviderError>;
    /// Fetch a flavor.
    async fn get_flavor(&self, flavor_id: &str) -> Result<Flavor, ProviderError>;
    /// Start resizing a server to another flavor.
    async fn resize_server(&self, server_id: &str, flavor_id: &str) -> Result<(), ProviderError>;
    /// Start migrating a server, optionally to a specific host.
    async fn migrate_server(&self, server_id: &str, host: Option<&str>)
    -> Result<(), ProviderError>;
    /// Commit a resize or migration.
    async fn confirm_resize(&self, server_id: &str) -> Result<(), ProviderError>;
    /// Roll back a resize or migration.
    async fn revert_resize(&self, server_id: &str) -> Result<(), ProviderError>;
    /// Reboot a server.
    async fn reboot_server(&self, server_id: &str) -> Result<(), ProviderError>;
    /// Delete a server.
    async fn delete_server(&self, server_id: &str) -> Result<(), ProviderError>;
}

/// Block storage provider.
#[async_trait]
pub trait VolumeClient: Send + Sync {
    /// Create a volume.
    async fn create_volume(
        &self,
        size: i64,
        name: &str,
        description: &str,
    ) -> Result<Volume, ProviderError>;
    /// Fetch a volume.
    async fn get_volume(&self, volume_id: &str) -> Result<Volume, ProviderError>;
    /// Attach a volume to a server at a device path.
    async fn attach_volume(
        &self,
        volume_id: &str,
        server_id: &str,
        device_path: &str,
    ) -> Result<(), ProviderError>;
    /// Detach a volume from its server.
    async fn detach_volume(&self, volume_id: &str) -> Result<(), ProviderError>;
    /// Grow a volume.
    async fn extend_volume(&self, volume_id: &str, new_size: i64) -> Result<(), ProviderError>;
}

/// DNS provider.
#[async_trait]
pub trait DnsClient: Send + Sync {
    /// Register the instance's name for an address.
    async fn create_instance_entry(&self, instance_id: &str, ip: &str)
    -> Result<(), ProviderError>;
    /// Remove the instance's entry.
    async fn delete_instance_entry(&self, instance_id: &str) -> Result<(), ProviderError>;
}

/// Object storage provider.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Fetch an object's headers.
    async fn head_object(
        &self,
        container: &str,
        name: &str,
    ) -> Result<HashMap<String, String>, ProviderError>;
    /// List objects in a container under a prefix.
    async fn get_container(
        &self,
        container: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectEntry>, ProviderError>;
    /// Delete an object.
    async fn delete_object(&self, container: &str, name: &str) -> Result<(), ProviderError>;
}

/// Network security groups.
#[async_trait]
pub trait SecurityGroupClient: Send + Sync {
    /// Create the security group of an instance.
    async fn create_for_instance(&self, instance_id: &str) -> Result<SecurityGroup, ProviderError>;
    /// Open a port range in a group.
    async fn create_rule(
        &self,
        group_id: &str,
        protocol: &str,
        from_port: u16,
        to_port: u16,
        cidr: &str,
    ) -> Result<(), ProviderError>;
}

/// Orchestration (stack) provider.
#[async_trait]
pub trait OrchestrationClient: Send + Sync {
    /// Create a stack from a template.
    async fn create_stack(
        &self,
        name: &str,
        template: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<(), ProviderError>;
    /// Fetch a stack by name.
    async fn get_stack(&self, name: &str) -> Result<Stack, ProviderError>;
    /// Fetch a named resource of a stack.
    async fn get_resource(
        &self,
        stack_id: &str,
        resource_name: &str,
    ) -> Result<StackResource, ProviderError>;
    /// Delete a stack and everything it created.
    async fn delete_stack(&self, name: &str) -> Result<(), ProviderError>;
}

/// Guest agent RPC.
#[async_trait]
pub trait GuestClient: Send + Sync {
    /// Install and configure the datastore. Returns once dispatched.
    async fn prepare(&self, instance_id: &str, request: &PrepareRequest) -> Result<(), GuestError>;
    /// Stop the datastore.
    async fn stop_db(&self, instance_id: &str, do_not_start_on_reboot: bool)
    -> Result<(), GuestError>;
    /// Restart the datastore.
    async fn restart(&self, instance_id: &str) -> Result<(), GuestError>;
    /// Start the datastore with a new configuration.
    async fn start_db_with_conf_changes(
        &self,
        instance_id: &str,
        config_contents: &str,
    ) -> Result<(), GuestError>;
    /// Replace the datastore configuration without starting it.
    async fn reset_configuration(
        &self,
        instance_id: &str,
        config_contents: &str,
    ) -> Result<(), GuestError>;
    /// Mount the data volume.
    async fn mount_volume(
        &self,
        instance_id: &str,
        device_path: &str,
        mount_point: &str,
    ) -> Result<(), GuestError>;
    /// Unmount the data volume.
    async fn unmount_volume(
        &self,
        instance_id: &str,
        device_path: &str,
        mount_point: &str,
    ) -> Result<(), GuestError>;
    /// Grow the filesystem to the volume size.
    async fn resize_fs(
        &self,
        instance_id: &str,
        device_path: &str,
        mount_point: &str,
    ) -> Result<(), GuestError>;
    /// Start a backup.
    async fn create_backup(&self, instance_id: &str, backup_info: &BackupInfo)
    -> Result<(), GuestError>;
    /// Write rendered overrides to the datastore configuration.
    async fn update_overrides(
        &self,
        instance_id: &str,
        overrides: &str,
        remove: bool,
    ) -> Result<(), GuestError>;
    /// Apply overrides to the running datastore.
    async fn apply_overrides(
        &self,
        instance_id: &str,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), GuestError>;
}

/// All collaborators an orchestration run needs.
#[derive(Clone)]
pub struct Clients {
    /// Compute provider.
    pub compute: Arc<dyn ComputeClient>,
    /// Block storage provider.
    pub volume: Arc<dyn VolumeClient>,
    /// DNS provider.
    pub dns: Arc<dyn DnsClient>,
    /// Object storage provider.
    pub object_store: Arc<dyn ObjectStoreClient>,
    /// Security groups.
    pub security_groups: Arc<dyn SecurityGroupClient>,
    /// Orchestration stacks.
    pub orchestration: Arc<dyn OrchestrationClient>,
    /// Guest agent.
    pub guest: Arc<dyn GuestClient>,
}

/// Guest client bound to one instance, applying per-call timeouts.
///
/// Quick calls (mount, unmount, resize_fs, overrides, dispatch of prepare and
/// backup) get the low timeout; calls that stop or start the datastore get
/// the high one.
#[derive(Clone)]
pub struct TimedGuest {
    client: Arc<dyn GuestClient>,
    instance_id: String,
    low: Duration,
    high: Duration,
}

impl TimedGuest {
    /// Bind `client` to `instance_id`.
    pub fn new(
        client: Arc<dyn GuestClient>,
        instance_id: impl Into<String>,
        low: Duration,
        high: Duration,
    ) -> Self {
        Self {
            client,
            instance_id: instance_id.into(),
            low,
            high,
        }
    }

    async fn call<F>(&self, method: &'static str, timeout: Duration, fut: F) -> Result<(), GuestError>
    where
        F: std::future::Future<Output = Result<(), GuestError>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(GuestError::Timeout { method, timeout }),
        }
    }

    /// See [`GuestClient::prepare`].
    pub async fn prepare(&self, request: &PrepareRequest) -> Result<(), GuestError> {
        self.call("prepare", self.low, self.client.prepare(&self.instance_id, request))
            .await
    }

    /// See [`GuestClient::stop_db`].
    pub async fn stop_db(&self, do_not_start_on_reboot: bool) -> Result<(), GuestError> {
        self.call(
            "stop_db",
            self.high,
            self.client.stop_db(&self.instance_id, do_not_start_on_reboot),
        )
        .await
    }

    /// See [`GuestClient::restart`].
    pub async fn restart(&self) -> Result<(), GuestError> {
        self.call("restart", self.high, self.client.restart(&self.instance_id))
            .await
    }

    /// See [`GuestClient::start_db_with_conf_changes`].
    pub async fn start_db_with_conf_changes(&self, config_contents: &str) -> Result<(), GuestError> {
        self.call(
            "start_db_with_conf_changes",
            self.high,
            self.client
                .start_db_with_conf_changes(&self.instance_id, config_contents),
        )
        .await
    }

    /// See [`GuestClient::reset_configuration`].
    pub async fn reset_configuration(&self, config_contents: &str) -> Result<(), GuestError> {
        self.call(
            "reset_configuration",
            self.high,
            self.client
                .reset_configuration(&self.instance_id, config_contents),
        )
        .await
    }

    /// See [`GuestClient::mount_volume`].
    pub async fn mount_volume(&self, device_path: &str, mount_point: &str) -> Result<(), GuestError> {
        self.call(
            "mount_volume",
            self.low,
            self.client
                .mount_volume(&self.instance_id, device_path, mount_point),
        )
        .await
    }

    /// See [`GuestClient::unmount_volume`].
    pub async fn unmount_volume(
        &self,
        device_path: &str,
        mount_point: &str,
    ) -> Result<(), GuestError> {
        self.call(
            "unmount_volume",
            self.low,
            self.client
                .unmount_volume(&self.instance_id, device_path, mount_point),
        )
        .await
    }

    /// See [`GuestClient::resize_fs`].
    pub async fn resize_fs(&self, device_path: &str, mount_point: &str) -> Result<(), GuestError> {
        self.call(
            "resize_fs",
            self.low,
            self.client
                .resize_fs(&self.instance_id, device_path, mount_point),
        )
        .await
    }

    /// See [`GuestClient::create_backup`].
    pub async fn create_backup(&self, backup_info: &BackupInfo) -> Result<(), GuestError> {
        self.call(
            "create_backup",
            self.low,
            self.client.create_backup(&self.instance_id, backup_info),
        )
        .await
    }

    /// See [`GuestClient::update_overrides`].
    pub async fn update_overrides(&self, overrides: &str, remove: bool) -> Result<(), GuestError> {
        self.call(
            "update_overrides",
            self.low,
            self.client
                .update_overrides(&self.instance_id, overrides, remove),
        )
        .await
    }

    /// See [`GuestClient::apply_overrides`].
    pub async fn apply_overrides(
        &self,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), GuestError> {
        self.call(
            "apply_overrides",
            self.low,
            self.client.apply_overrides(&self.instance_id, overrides),
        )
        .await
    }
}
