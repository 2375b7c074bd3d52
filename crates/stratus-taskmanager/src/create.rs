// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance creation.
//!
//! Takes an instance from "record exists, no resources" to "guest prepared,
//! service running". Steps run strictly in order:
//!
//! ```text
//! security group -> server (+ volume) -> render config -> guest prepare
//!     -> reset task status -> DNS -> wait for RUNNING + usage event
//! ```
//!
//! A failing provisioning step persists its `BUILDING_ERROR_*` task status
//! and returns the error. The final activation wait never fails the create:
//! a timeout flags the instance, anything else is logged and counted.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use stratus_core::{InstanceRecord, InstanceUpdate, ServiceStatus, TaskStatus};
use tracing::{debug, error, info, warn};

use crate::clients::{
    BackupInfo, Flavor, Nic, PrepareRequest, Server, ServerCreateRequest, ServerStatus,
    VolumeSpec, VolumeStatus,
};
use crate::config::ProvisioningStrategy;
use crate::datastore::DatastoreManager;
use crate::error::{Error, Result};
use crate::instance::{BuiltInstance, TaskContext, device_path, volume_support};
use crate::poll::poll_until;

/// Path of the guest info file injected into new servers.
pub const GUEST_INFO_PATH: &str = "/etc/guest_info";

const HEAT_RESOURCE_COMPLETE: &str = "CREATE_COMPLETE";

/// Everything needed to build an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    /// Instance to build. The record must already exist.
    pub instance_id: String,
    /// Display name, used when the record has to be created.
    #[serde(default)]
    pub name: String,
    /// Owning tenant, used when the record has to be created.
    #[serde(default)]
    pub tenant_id: String,
    /// Requested hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Flavor to boot.
    pub flavor: Flavor,
    /// Image to boot.
    pub image_id: String,
    /// Datastore to install.
    pub datastore_manager: DatastoreManager,
    /// Databases to create.
    #[serde(default)]
    pub databases: Vec<Value>,
    /// Users to create.
    #[serde(default)]
    pub users: Vec<Value>,
    /// Packages to install.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Data volume size in GB.
    #[serde(default)]
    pub volume_size: Option<i64>,
    /// Backup to restore from.
    #[serde(default)]
    pub backup_id: Option<String>,
    /// Requested availability zone.
    #[serde(default)]
    pub availability_zone: Option<String>,
    /// Root password, when root is enabled on create.
    #[serde(default)]
    pub root_password: Option<String>,
    /// Network interfaces.
    #[serde(default)]
    pub nics: Vec<Nic>,
    /// Configuration overrides.
    #[serde(default)]
    pub overrides: BTreeMap<String, Value>,
}

/// Build an instance.
pub async fn create_instance(ctx: &TaskContext, request: &CreateInstanceRequest) -> Result<()> {
    let record = ctx.persistence.find_instance(&request.instance_id).await?;
    info!(
        instance_id = %record.id,
        datastore_manager = %request.datastore_manager,
        flavor_id = %request.flavor.id,
        "Creating instance"
    );
    InstanceCreator {
        ctx,
        request,
        record,
    }
    .run()
    .await
}

struct InstanceCreator<'a> {
    ctx: &'a TaskContext,
    request: &'a CreateInstanceRequest,
    record: InstanceRecord,
}

impl InstanceCreator<'_> {
    fn id(&self) -> &str {
        &self.record.id
    }

    fn manager(&self) -> DatastoreManager {
        self.request.datastore_manager
    }

    fn volume_support(&self) -> bool {
        volume_support(&self.ctx.config, self.manager())
    }

    /// Persist a classified failure and hand the error back.
    async fn fail(&self, status: TaskStatus, err: Error) -> Error {
        error!(
            instance_id = %self.id(),
            task_status = ?status,
            error = %err,
            "Instance creation step failed"
        );
        if let Err(e) = self
            .ctx
            .persistence
            .set_task_status(self.id(), status)
            .await
        {
            error!(instance_id = %self.id(), error = %e, "Failed to persist task status");
        }
        err
    }

    async fn run(self) -> Result<()> {
        let security_groups = match self.create_security_group().await {
            Ok(groups) => groups,
            Err(e) => return Err(self.fail(TaskStatus::BuildingErrorSecGroup, e).await),
        };

        let (server, volume_id) = match self.ctx.config.provisioning_strategy() {
            ProvisioningStrategy::Heat => match self.create_with_heat().await {
                Ok(created) => created,
                Err(e) => return Err(self.fail(TaskStatus::BuildingErrorServer, e).await),
            },
            ProvisioningStrategy::ServerVolume => {
                match self.create_server_with_volume(&security_groups).await {
                    Ok(created) => created,
                    Err(e) => return Err(self.fail(TaskStatus::BuildingErrorServer, e).await),
                }
            }
            ProvisioningStrategy::Individual => {
                let volume_id = if self.volume_support() {
                    match self.create_volume().await {
                        Ok(id) => Some(id),
                        Err(e) => return Err(self.fail(TaskStatus::BuildingErrorVolume, e).await),
                    }
                } else {
                    None
                };
                match self.create_server(&security_groups, volume_id.as_deref()).await {
                    Ok(server) => (server, volume_id),
                    Err(e) => return Err(self.fail(TaskStatus::BuildingErrorServer, e).await),
                }
            }
        };

        self.ctx
            .persistence
            .update_instance(
                self.id(),
                &InstanceUpdate {
                    compute_instance_id: Some(server.id.clone()),
                    volume_id: volume_id.clone(),
                    volume_size: self.request.volume_size.filter(|_| self.volume_support()),
                    ..Default::default()
                },
            )
            .await?;
        let record = self.ctx.persistence.find_instance(self.id()).await?;

        let mut instance = BuiltInstance {
            ctx: self.ctx.clone(),
            record,
            server,
            manager: self.manager(),
        };

        self.prepare_guest(&instance).await?;

        if let Some(password) = &self.request.root_password
            && !password.is_empty()
        {
            self.ctx
                .persistence
                .record_root_enabled(instance.id(), "root")
                .await?;
        }

        instance.refresh_record().await?;
        if !instance.record.task_status.is_error() {
            instance.reset_task_status().await?;
        }

        if self.ctx.config.dns_support
            && let Err(e) = self.create_dns_entry(&instance).await
        {
            return Err(self.fail(TaskStatus::BuildingErrorDns, e).await);
        }

        self.wait_for_activation(&mut instance).await
    }

    async fn create_security_group(&self) -> Result<Vec<String>> {
        let config = &self.ctx.config;
        if !config.security_groups_support
            || config.provisioning_strategy() == ProvisioningStrategy::Heat
        {
            return Ok(Vec::new());
        }

        let section = config.datastore(self.manager());
        let tcp = dedup_port_ranges(&section.tcp_ports)?;
        let udp = dedup_port_ranges(&section.udp_ports)?;

        let client = &self.ctx.clients.security_groups;
        let group = client.create_for_instance(self.id()).await?;
        for (protocol, ranges) in [("tcp", tcp), ("udp", udp)] {
            for (from, to) in ranges {
                client
                    .create_rule(
                        &group.id,
                        protocol,
                        from,
                        to,
                        &config.security_group_rule_cidr,
                    )
                    .await?;
            }
        }
        debug!(instance_id = %self.id(), group = %group.name, "Created security group");
        Ok(vec![group.name])
    }

    async fn create_volume(&self) -> Result<String> {
        let size = self.request.volume_size.ok_or_else(|| {
            Error::Orchestration("Volume size is required when volumes are enabled".to_string())
        })?;
        let volume = self
            .ctx
            .clients
            .volume
            .create_volume(
                size,
                &format!("{}-{}", self.manager(), self.id()),
                &format!("{} volume for {}", self.manager(), self.id()),
            )
            .await?;
        self.ctx
            .persistence
            .update_instance(
                self.id(),
                &InstanceUpdate {
                    volume_id: Some(volume.id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let client = &self.ctx.clients.volume;
        let volume_id = volume.id.as_str();
        let volume = poll_until(
            move || async move { Ok::<_, Error>(client.get_volume(volume_id).await?) },
            |v| Ok(matches!(v.status, VolumeStatus::Available | VolumeStatus::Error)),
            self.ctx.config.poll_interval,
            self.ctx.config.volume_time_out,
        )
        .await?;
        if volume.status == VolumeStatus::Error {
            return Err(Error::VolumeCreationFailure(volume.id));
        }
        info!(instance_id = %self.id(), volume_id = %volume.id, size, "Created volume");
        Ok(volume.id)
    }

    fn server_request(
        &self,
        security_groups: &[String],
        block_device_mapping: Option<BTreeMap<String, String>>,
        volume: Option<VolumeSpec>,
    ) -> ServerCreateRequest {
        let mut files = BTreeMap::new();
        files.insert(
            GUEST_INFO_PATH.to_string(),
            guest_info(self.id(), self.manager(), &self.record.tenant_id),
        );
        ServerCreateRequest {
            name: self
                .record
                .hostname
                .clone()
                .unwrap_or_else(|| self.record.name.clone()),
            image_id: self.request.image_id.clone(),
            flavor_id: self.request.flavor.id.clone(),
            files,
            security_groups: security_groups.to_vec(),
            block_device_mapping,
            volume,
            availability_zone: self.request.availability_zone.clone(),
            nics: self.request.nics.clone(),
        }
    }

    async fn create_server(
        &self,
        security_groups: &[String],
        volume_id: Option<&str>,
    ) -> Result<Server> {
        let mapping = match (volume_id, self.request.volume_size) {
            (Some(id), Some(size)) => {
                let mut mapping = BTreeMap::new();
                mapping.insert(
                    self.ctx.config.block_device_mapping.clone(),
                    format!("{}::{}:1", id, size),
                );
                Some(mapping)
            }
            _ => None,
        };
        let request = self.server_request(security_groups, mapping, None);
        let server = self.ctx.clients.compute.create_server(&request).await?;
        info!(instance_id = %self.id(), server_id = %server.id, "Created compute server");
        Ok(server)
    }

    async fn create_server_with_volume(
        &self,
        security_groups: &[String],
    ) -> Result<(Server, Option<String>)> {
        let volume = match (self.volume_support(), self.request.volume_size) {
            (true, Some(size)) => Some(VolumeSpec {
                size,
                name: format!("{}-{}", self.manager(), self.id()),
                description: format!("{} volume for {}", self.manager(), self.id()),
            }),
            _ => None,
        };
        let request = self.server_request(security_groups, None, volume);
        let server = self.ctx.clients.compute.create_server(&request).await?;
        let volume_id = if self.volume_support() {
            server.attached_volumes.last().cloned()
        } else {
            None
        };
        info!(
            instance_id = %self.id(),
            server_id = %server.id,
            volume_id = ?volume_id,
            "Created compute server with volume"
        );
        Ok((server, volume_id))
    }

    async fn create_with_heat(&self) -> Result<(Server, Option<String>)> {
        let config = &self.ctx.config;
        let volume_support = self.volume_support();
        let template = self.ctx.renderer.render_heat_template(
            self.manager(),
            volume_support,
            &device_path(config, self.manager()),
            self.request.nics.len(),
        );

        let mut parameters = BTreeMap::new();
        parameters.insert("Flavor".to_string(), json!(self.request.flavor.id));
        parameters.insert(
            "VolumeSize".to_string(),
            json!(self.request.volume_size.unwrap_or(0)),
        );
        parameters.insert("InstanceId".to_string(), json!(self.id()));
        parameters.insert("ImageId".to_string(), json!(self.request.image_id));
        parameters.insert(
            "DatastoreManager".to_string(),
            json!(self.manager().as_str()),
        );
        parameters.insert(
            "AvailabilityZone".to_string(),
            json!(self.request.availability_zone.as_deref().unwrap_or("nova")),
        );
        parameters.insert("TenantId".to_string(), json!(self.record.tenant_id));
        for (index, nic) in self.request.nics.iter().enumerate() {
            parameters.insert(format!("Port{}NetId", index), json!(nic.net_id));
        }

        let client = &self.ctx.clients.orchestration;
        let stack_name = format!("stratus-{}", self.id());
        client
            .create_stack(&stack_name, &template, &parameters)
            .await?;

        let name = stack_name.as_str();
        let stack = poll_until(
            move || async move { Ok::<_, Error>(client.get_stack(name).await?) },
            |s| Ok(s.status == "CREATE_COMPLETE" || s.status == "CREATE_FAILED"),
            config.usage_sleep_time,
            config.heat_time_out,
        )
        .await?;
        if stack.action != "CREATE" || stack.status != "CREATE_COMPLETE" {
            return Err(Error::Orchestration(format!(
                "Heat stack {} failed: {} {}",
                stack_name, stack.action, stack.status
            )));
        }

        let base = client.get_resource(&stack.id, "BaseInstance").await?;
        if base.resource_status != HEAT_RESOURCE_COMPLETE {
            return Err(Error::Orchestration(format!(
                "Heat resource BaseInstance is {}",
                base.resource_status
            )));
        }
        let volume_id = if volume_support {
            let volume = client.get_resource(&stack.id, "DataVolume").await?;
            if volume.resource_status != HEAT_RESOURCE_COMPLETE {
                return Err(Error::Orchestration(format!(
                    "Heat resource DataVolume is {}",
                    volume.resource_status
                )));
            }
            Some(volume.physical_resource_id)
        } else {
            None
        };

        let server = self
            .ctx
            .clients
            .compute
            .get_server(&base.physical_resource_id)
            .await?;
        info!(instance_id = %self.id(), stack = %stack_name, server_id = %server.id, "Created stack");
        Ok((server, volume_id))
    }

    async fn prepare_guest(&self, instance: &BuiltInstance) -> Result<()> {
        let config_contents = self
            .ctx
            .renderer
            .render_config(self.manager(), &self.request.flavor);
        let overrides = if self.request.overrides.is_empty() {
            None
        } else {
            Some(
                self.ctx
                    .renderer
                    .render_overrides(self.manager(), &self.request.overrides),
            )
        };

        let backup_info = match &self.request.backup_id {
            Some(backup_id) => {
                let backup = self
                    .ctx
                    .persistence
                    .get_backup(backup_id)
                    .await?
                    .ok_or_else(|| Error::BackupNotFound(backup_id.clone()))?;
                Some(BackupInfo {
                    id: backup.id,
                    location: backup.location,
                    backup_type: backup.backup_type,
                    checksum: backup.checksum,
                })
            }
            None => None,
        };

        let request = PrepareRequest {
            memory_mb: self.request.flavor.ram,
            packages: self.request.packages.clone(),
            databases: self.request.databases.clone(),
            users: self.request.users.clone(),
            device_path: instance.device_path(),
            mount_point: instance.mount_point(),
            backup_info,
            config_contents,
            root_password: self.request.root_password.clone(),
            overrides,
        };
        instance.guest().prepare(&request).await?;
        debug!(instance_id = %self.id(), "Guest prepare dispatched");
        Ok(())
    }

    async fn create_dns_entry(&self, instance: &BuiltInstance) -> Result<()> {
        let compute = &self.ctx.clients.compute;
        let server_id = instance.server.id.as_str();
        let server = poll_until(
            move || async move { Ok::<_, Error>(compute.get_server(server_id).await?) },
            |server| {
                if server.first_address().is_some() {
                    return Ok(true);
                }
                if server.status == ServerStatus::Error {
                    return Err(Error::Orchestration(format!(
                        "Server {} went to ERROR before getting an address",
                        server.id
                    )));
                }
                Ok(false)
            },
            self.ctx.config.dns_poll_interval,
            self.ctx.config.dns_time_out,
        )
        .await?;

        let ip = server.first_address().unwrap_or_default();
        self.ctx
            .clients
            .dns
            .create_instance_entry(self.id(), ip)
            .await?;
        info!(instance_id = %self.id(), ip = %ip, "Registered DNS entry");
        Ok(())
    }

    async fn wait_for_activation(&self, instance: &mut BuiltInstance) -> Result<()> {
        let outcome = self.wait_until_running(instance).await;
        let outcome = match outcome {
            Ok(()) => self.send_create_event(instance).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if e.is_poll_timeout() => {
                warn!(
                    instance_id = %self.id(),
                    error = %e,
                    "Service did not become active in time, skipping usage event"
                );
                if self.ctx.config.update_status_on_fail {
                    instance
                        .set_service_status(ServiceStatus::FailedTimeoutGuestagent)
                        .await?;
                    instance
                        .update(InstanceUpdate::task_status(
                            TaskStatus::BuildingErrorTimeoutGa,
                        ))
                        .await?;
                }
                Ok(())
            }
            Err(e) => {
                self.ctx.metrics.record_swallowed_activation_error();
                warn!(
                    instance_id = %self.id(),
                    error = %e,
                    "Error while waiting for the service to become active"
                );
                Ok(())
            }
        }
    }

    async fn wait_until_running(&self, instance: &mut BuiltInstance) -> Result<()> {
        let persistence = &self.ctx.persistence;
        let compute = &self.ctx.clients.compute;
        let id = self.id();
        let server_id = instance.server.id.as_str();

        let (_, server) = poll_until(
            move || async move {
                let status = persistence.get_service_status(id).await?;
                let server = compute.get_server(server_id).await?;
                Ok::<_, Error>((status, server))
            },
            |(status, server)| {
                if *status == Some(ServiceStatus::Running) {
                    return Ok(true);
                }
                if matches!(server.status, ServerStatus::Error | ServerStatus::Failed) {
                    return Err(Error::Orchestration(format!(
                        "Server not active, status: {}",
                        server.status
                    )));
                }
                match status {
                    Some(s) if !s.is_provisioning() => Err(Error::Orchestration(format!(
                        "Service not active, status: {}",
                        s
                    ))),
                    _ => Ok(false),
                }
            },
            self.ctx.config.usage_sleep_time,
            self.ctx.config.datastore(self.manager()).usage_timeout,
        )
        .await?;

        instance.server = server;
        Ok(())
    }

    async fn send_create_event(&self, instance: &mut BuiltInstance) -> Result<()> {
        instance.refresh_record().await?;
        let mut extra = Map::new();
        extra.insert(
            "datastore_manager".to_string(),
            json!(self.manager().as_str()),
        );
        instance
            .send_usage_event(
                "create",
                &self.request.flavor,
                Some(self.request.flavor.ram),
                extra,
            )
            .await?;
        info!(instance_id = %self.id(), "Instance is active");
        Ok(())
    }
}

/// Contents of the guest info file.
pub fn guest_info(instance_id: &str, manager: DatastoreManager, tenant_id: &str) -> String {
    format!(
        "[DEFAULT]\nguest_id={}\ndatastore_manager={}\ntenant_id={}\n",
        instance_id, manager, tenant_id
    )
}

/// Parse `"3306"` or `"1000-2000"` into an inclusive port range.
pub fn parse_port_range(spec: &str) -> Result<(u16, u16)> {
    let (from, to) = match spec.split_once('-') {
        Some((from, to)) => (from.trim(), to.trim()),
        None => (spec.trim(), spec.trim()),
    };
    match (from.parse::<u16>(), to.parse::<u16>()) {
        (Ok(f), Ok(t)) if f <= t => Ok((f, t)),
        _ => Err(Error::MalformedSecurityGroupRule {
            from: from.to_string(),
            to: to.to_string(),
        }),
    }
}

fn dedup_port_ranges(specs: &[String]) -> Result<BTreeSet<(u16, u16)>> {
    specs.iter().map(|s| parse_port_range(s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("3306").unwrap(), (3306, 3306));
        assert_eq!(parse_port_range("1000-2000").unwrap(), (1000, 2000));
        assert_eq!(parse_port_range(" 21100 - 21199 ").unwrap(), (21100, 21199));
    }

    #[test]
    fn test_parse_port_range_rejects_garbage() {
        for spec in ["", "abc", "2000-1000", "1-2-3", "70000"] {
            let err = parse_port_range(spec).unwrap_err();
            assert!(
                matches!(err, Error::MalformedSecurityGroupRule { .. }),
                "{} was accepted",
                spec
            );
        }
    }

    #[test]
    fn test_dedup_port_ranges() {
        let specs = vec!["3306".to_string(), "3306".to_string(), "1-2".to_string()];
        let ranges = dedup_port_ranges(&specs).unwrap();
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn test_guest_info() {
        assert_eq!(
            guest_info("i1", DatastoreManager::Mysql, "t1"),
            "[DEFAULT]\nguest_id=i1\ndatastore_manager=mysql\ntenant_id=t1\n"
        );
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: CreateInstanceRequest = serde_json::from_value(json!({
            "instance_id": "i1",
            "flavor": {"id": "2", "name": "m1.small", "ram": 512},
            "image_id": "img1",
            "datastore_manager": "mysql",
            "volume_size": 1
        }))
        .unwrap();
        assert_eq!(request.datastore_manager, DatastoreManager::Mysql);
        assert!(request.overrides.is_empty());
        assert!(request.backup_id.is_none());
    }
}
