// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process simulated cloud and guest agent.
//!
//! Used by the binary's `--simulated` mode and by tests. Resources move
//! through scripted status transitions: each `get_*` call applies the next
//! pending transition, so polling loops observe the same progressions a real
//! provider would report. Any operation can be made to fail with
//! [`SimulatedCloud::fail`] or [`SimulatedGuest::fail`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use stratus_core::{Persistence, ServiceStatus};
use tokio::sync::Mutex;

use super::*;
use crate::error::{GuestError, ProviderError};

/// What happens to a server after a resize or migrate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeBehavior {
    /// Reaches `VERIFY_RESIZE` with the requested flavor.
    #[default]
    Completes,
    /// Reaches `VERIFY_RESIZE` but keeps the old flavor.
    KeepsOldFlavor,
    /// Goes to `ERROR` instead of `VERIFY_RESIZE`.
    Errors,
}

/// What happens to a volume after an extend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtendBehavior {
    /// Becomes `available` with the requested size.
    #[default]
    Completes,
    /// Stays `extending` forever.
    StuckExtending,
    /// Becomes `available` with the given size.
    WrongSize(i64),
    /// Reports the requested size while still `extending`.
    SizedWhileExtending,
}

#[derive(Debug, Clone)]
struct ServerTransition {
    status: ServerStatus,
    flavor_id: Option<String>,
    host: Option<String>,
}

impl ServerTransition {
    fn to(status: ServerStatus) -> Self {
        Self {
            status,
            flavor_id: None,
            host: None,
        }
    }
}

#[derive(Debug, Clone)]
struct SimServer {
    server: Server,
    pending: VecDeque<ServerTransition>,
    pre_resize_flavor: Option<String>,
}

#[derive(Debug, Clone)]
struct SimVolume {
    volume: Volume,
    pending: VecDeque<(VolumeStatus, Option<i64>)>,
}

#[derive(Debug, Clone)]
struct SimStack {
    stack: Stack,
    pending: VecDeque<String>,
    resources: HashMap<String, StackResource>,
}

/// Rule opened in a simulated security group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedRule {
    /// `tcp` or `udp`.
    pub protocol: String,
    /// Lower port.
    pub from_port: u16,
    /// Upper port.
    pub to_port: u16,
    /// Allowed CIDR.
    pub cidr: String,
}

#[derive(Default)]
struct CloudState {
    servers: HashMap<String, SimServer>,
    volumes: HashMap<String, SimVolume>,
    flavors: HashMap<String, Flavor>,
    stacks: HashMap<String, SimStack>,
    objects: BTreeMap<(String, String), HashMap<String, String>>,
    dns_entries: HashMap<String, String>,
    security_groups: HashMap<String, SecurityGroup>,
    rules: HashMap<String, Vec<SimulatedRule>>,
    failures: HashMap<String, ProviderError>,
    calls: Vec<String>,
    boot_status: Option<ServerStatus>,
    volume_create_status: Option<VolumeStatus>,
    resize_behavior: ResizeBehavior,
    extend_behavior: ExtendBehavior,
    next_id: u64,
}

impl CloudState {
    fn enter(&mut self, op: &str, detail: &str) -> Result<(), ProviderError> {
        self.calls.push(format!("{}:{}", op, detail));
        match self.failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn server_mut(&mut self, server_id: &str) -> Result<&mut SimServer, ProviderError> {
        self.servers
            .get_mut(server_id)
            .ok_or_else(|| ProviderError::not_found("server", server_id))
    }

    fn volume_mut(&mut self, volume_id: &str) -> Result<&mut SimVolume, ProviderError> {
        self.volumes
            .get_mut(volume_id)
            .ok_or_else(|| ProviderError::not_found("volume", volume_id))
    }

    fn boot(&mut self, request: &ServerCreateRequest, volumes: Vec<String>) -> Server {
        let id = self.next_id("server");
        let mut addresses = BTreeMap::new();
        addresses.insert(
            "private".to_string(),
            vec![format!("10.0.0.{}", self.next_id % 250 + 2)],
        );
        let server = Server {
            id: id.clone(),
            status: ServerStatus::Build,
            flavor_id: request.flavor_id.clone(),
            addresses,
            availability_zone: request
                .availability_zone
                .clone()
                .or_else(|| Some("nova".to_string())),
            host: Some("compute-1".to_string()),
            attached_volumes: volumes,
        };
        let target = self.boot_status.clone().unwrap_or(ServerStatus::Active);
        self.servers.insert(
            id,
            SimServer {
                server: server.clone(),
                pending: VecDeque::from([ServerTransition::to(target)]),
                pre_resize_flavor: None,
            },
        );
        server
    }

    fn new_volume(&mut self, size: i64, status: VolumeStatus) -> Volume {
        let id = self.next_id("volume");
        let volume = Volume {
            id: id.clone(),
            status,
            size,
        };
        self.volumes.insert(
            id,
            SimVolume {
                volume: volume.clone(),
                pending: VecDeque::new(),
            },
        );
        volume
    }

    fn start_resize(&mut self, server_id: &str, flavor_id: Option<&str>, host: Option<&str>)
    -> Result<(), ProviderError> {
        let behavior = self.resize_behavior;
        let sim = self.server_mut(server_id)?;
        sim.pre_resize_flavor = Some(sim.server.flavor_id.clone());
        sim.server.status = ServerStatus::Resize;
        let done = match behavior {
            ResizeBehavior::Completes => ServerTransition {
                status: ServerStatus::VerifyResize,
                flavor_id: flavor_id.map(str::to_string),
                host: host.map(str::to_string),
            },
            ResizeBehavior::KeepsOldFlavor => ServerTransition::to(ServerStatus::VerifyResize),
            ResizeBehavior::Errors => ServerTransition::to(ServerStatus::Error),
        };
        sim.pending = VecDeque::from([ServerTransition::to(ServerStatus::Resize), done]);
        Ok(())
    }
}

/// Simulated compute, volume, DNS, object store, security group and
/// orchestration provider.
pub struct SimulatedCloud {
    state: Arc<Mutex<CloudState>>,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCloud {
    /// Create a cloud with flavors `1` to `4` (512 MB to 4096 MB).
    pub fn new() -> Self {
        let mut state = CloudState::default();
        for (id, name, ram) in [
            ("1", "m1.tiny", 512),
            ("2", "m1.small", 1024),
            ("3", "m1.medium", 2048),
            ("4", "m1.large", 4096),
        ] {
            state.flavors.insert(
                id.to_string(),
                Flavor {
                    id: id.to_string(),
                    name: name.to_string(),
                    ram,
                },
            );
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Make every call of `op` fail with `err` until cleared.
    pub async fn fail(&self, op: &str, err: ProviderError) {
        self.state.lock().await.failures.insert(op.to_string(), err);
    }

    /// Stop failing `op`.
    pub async fn clear_failure(&self, op: &str) {
        self.state.lock().await.failures.remove(op);
    }

    /// Status new servers reach after `BUILD`. Defaults to `ACTIVE`.
    pub async fn set_boot_status(&self, status: ServerStatus) {
        self.state.lock().await.boot_status = Some(status);
    }

    /// Status new volumes reach after `creating`. Defaults to `available`.
    pub async fn set_volume_create_status(&self, status: VolumeStatus) {
        self.state.lock().await.volume_create_status = Some(status);
    }

    /// Outcome of subsequent resize and migrate calls.
    pub async fn set_resize_behavior(&self, behavior: ResizeBehavior) {
        self.state.lock().await.resize_behavior = behavior;
    }

    /// Outcome of subsequent extend calls.
    pub async fn set_extend_behavior(&self, behavior: ExtendBehavior) {
        self.state.lock().await.extend_behavior = behavior;
    }

    /// Register a server that already exists.
    pub async fn insert_server(&self, server: Server) {
        self.state.lock().await.servers.insert(
            server.id.clone(),
            SimServer {
                server,
                pending: VecDeque::new(),
                pre_resize_flavor: None,
            },
        );
    }

    /// Register a volume that already exists.
    pub async fn insert_volume(&self, volume: Volume) {
        self.state.lock().await.volumes.insert(
            volume.id.clone(),
            SimVolume {
                volume,
                pending: VecDeque::new(),
            },
        );
    }

    /// Store an object with the given headers.
    pub async fn put_object(&self, container: &str, name: &str, headers: HashMap<String, String>) {
        self.state
            .lock()
            .await
            .objects
            .insert((container.to_string(), name.to_string()), headers);
    }

    /// Whether an object exists.
    pub async fn has_object(&self, container: &str, name: &str) -> bool {
        self.state
            .lock()
            .await
            .objects
            .contains_key(&(container.to_string(), name.to_string()))
    }

    /// Current server state, without applying pending transitions.
    pub async fn server(&self, server_id: &str) -> Option<Server> {
        self.state
            .lock()
            .await
            .servers
            .get(server_id)
            .map(|s| s.server.clone())
    }

    /// Current volume state, without applying pending transitions.
    pub async fn volume(&self, volume_id: &str) -> Option<Volume> {
        self.state
            .lock()
            .await
            .volumes
            .get(volume_id)
            .map(|v| v.volume.clone())
    }

    /// Address registered in DNS for an instance.
    pub async fn dns_entry(&self, instance_id: &str) -> Option<String> {
        self.state.lock().await.dns_entries.get(instance_id).cloned()
    }

    /// Rules opened in an instance's security group.
    pub async fn security_group_rules(&self, instance_id: &str) -> Vec<SimulatedRule> {
        let state = self.state.lock().await;
        state
            .security_groups
            .get(instance_id)
            .and_then(|group| state.rules.get(&group.id))
            .cloned()
            .unwrap_or_default()
    }

    /// All calls made so far, as `op:detail`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    /// Number of calls of `op`.
    pub async fn call_count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Bundle this cloud and `guest` into [`Clients`].
    pub fn into_clients(self: Arc<Self>, guest: Arc<dyn GuestClient>) -> Clients {
        Clients {
            compute: self.clone(),
            volume: self.clone(),
            dns: self.clone(),
            object_store: self.clone(),
            security_groups: self.clone(),
            orchestration: self,
            guest,
        }
    }
}

#[async_trait]
impl ComputeClient for SimulatedCloud {
    async fn create_server(&self, request: &ServerCreateRequest) -> Result<Server, ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("create_server", &request.name)?;
        if !state.flavors.contains_key(&request.flavor_id) {
            return Err(ProviderError::not_found("flavor", &request.flavor_id));
        }
        let volumes = match &request.volume {
            Some(spec) => vec![state.new_volume(spec.size, VolumeStatus::InUse).id],
            None => Vec::new(),
        };
        Ok(state.boot(request, volumes))
    }

    async fn get_server(&self, server_id: &str) -> Result<Server, ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("get_server", server_id)?;
        let sim = state.server_mut(server_id)?;
        if let Some(next) = sim.pending.pop_front() {
            sim.server.status = next.status;
            if let Some(flavor_id) = next.flavor_id {
                sim.server.flavor_id = flavor_id;
            }
            if next.host.is_some() {
                sim.server.host = next.host;
            }
        }
        Ok(sim.server.clone())
    }

    async fn get_flavor(&self, flavor_id: &str) -> Result<Flavor, ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("get_flavor", flavor_id)?;
        state
            .flavors
            .get(flavor_id)
            .cloned()
            .ok_or_else(|| ProviderError::not_found("flavor", flavor_id))
    }

    async fn resize_server(&self, server_id: &str, flavor_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("resize_server", &format!("{}:{}", server_id, flavor_id))?;
        state.start_resize(server_id, Some(flavor_id), None)
    }

    async fn migrate_server(
        &self,
        server_id: &str,
        host: Option<&str>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter(
            "migrate_server",
            &format!("{}:{}", server_id, host.unwrap_or("-")),
        )?;
        let target = host.unwrap_or("compute-2");
        state.start_resize(server_id, None, Some(target))
    }

    async fn confirm_resize(&self, server_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("confirm_resize", server_id)?;
        let sim = state.server_mut(server_id)?;
        sim.server.status = ServerStatus::Active;
        sim.pending.clear();
        sim.pre_resize_flavor = None;
        Ok(())
    }

    async fn revert_resize(&self, server_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("revert_resize", server_id)?;
        let sim = state.server_mut(server_id)?;
        sim.server.status = ServerStatus::RevertResize;
        sim.pending = VecDeque::from([ServerTransition {
            status: ServerStatus::Active,
            flavor_id: sim.pre_resize_flavor.take(),
            host: None,
        }]);
        Ok(())
    }

    async fn reboot_server(&self, server_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("reboot_server", server_id)?;
        let sim = state.server_mut(server_id)?;
        sim.server.status = ServerStatus::Reboot;
        sim.pending = VecDeque::from([ServerTransition::to(ServerStatus::Active)]);
        Ok(())
    }

    async fn delete_server(&self, server_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("delete_server", server_id)?;
        state
            .servers
            .remove(server_id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found("server", server_id))
    }
}

#[async_trait]
impl VolumeClient for SimulatedCloud {
    async fn create_volume(
        &self,
        size: i64,
        name: &str,
        _description: &str,
    ) -> Result<Volume, ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("create_volume", name)?;
        let target = state
            .volume_create_status
            .clone()
            .unwrap_or(VolumeStatus::Available);
        let volume = state.new_volume(size, VolumeStatus::Creating);
        let sim = state.volume_mut(&volume.id)?;
        sim.pending = VecDeque::from([(VolumeStatus::Creating, None), (target, None)]);
        Ok(volume)
    }

    async fn get_volume(&self, volume_id: &str) -> Result<Volume, ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("get_volume", volume_id)?;
        let sim = state.volume_mut(volume_id)?;
        if let Some((status, size)) = sim.pending.pop_front() {
            sim.volume.status = status;
            if let Some(size) = size {
                sim.volume.size = size;
            }
        }
        Ok(sim.volume.clone())
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        server_id: &str,
        device_path: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter(
            "attach_volume",
            &format!("{}:{}:{}", volume_id, server_id, device_path),
        )?;
        let sim = state.volume_mut(volume_id)?;
        sim.volume.status = VolumeStatus::Attaching;
        sim.pending = VecDeque::from([(VolumeStatus::InUse, None)]);
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("detach_volume", volume_id)?;
        let sim = state.volume_mut(volume_id)?;
        sim.volume.status = VolumeStatus::Detaching;
        sim.pending = VecDeque::from([(VolumeStatus::Available, None)]);
        Ok(())
    }

    async fn extend_volume(&self, volume_id: &str, new_size: i64) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("extend_volume", &format!("{}:{}", volume_id, new_size))?;
        let behavior = state.extend_behavior;
        let sim = state.volume_mut(volume_id)?;
        sim.volume.status = VolumeStatus::Extending;
        sim.pending = match behavior {
            ExtendBehavior::Completes => {
                VecDeque::from([(VolumeStatus::Available, Some(new_size))])
            }
            ExtendBehavior::StuckExtending => VecDeque::new(),
            ExtendBehavior::WrongSize(size) => {
                VecDeque::from([(VolumeStatus::Available, Some(size))])
            }
            ExtendBehavior::SizedWhileExtending => {
                VecDeque::from([(VolumeStatus::Extending, Some(new_size))])
            }
        };
        Ok(())
    }
}

#[async_trait]
impl DnsClient for SimulatedCloud {
    async fn create_instance_entry(&self, instance_id: &str, ip: &str)
    -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("create_instance_entry", &format!("{}:{}", instance_id, ip))?;
        state
            .dns_entries
            .insert(instance_id.to_string(), ip.to_string());
        Ok(())
    }

    async fn delete_instance_entry(&self, instance_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("delete_instance_entry", instance_id)?;
        state.dns_entries.remove(instance_id);
        Ok(())
    }
}

#[async_trait]
impl ObjectStoreClient for SimulatedCloud {
    async fn head_object(
        &self,
        container: &str,
        name: &str,
    ) -> Result<HashMap<String, String>, ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("head_object", &format!("{}/{}", container, name))?;
        state
            .objects
            .get(&(container.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::not_found("object", format!("{}/{}", container, name)))
    }

    async fn get_container(
        &self,
        container: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectEntry>, ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("get_container", &format!("{}/{}", container, prefix))?;
        Ok(state
            .objects
            .keys()
            .filter(|(c, name)| c == container && name.starts_with(prefix))
            .map(|(_, name)| ObjectEntry { name: name.clone() })
            .collect())
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("delete_object", &format!("{}/{}", container, name))?;
        state
            .objects
            .remove(&(container.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found("object", format!("{}/{}", container, name)))
    }
}

#[async_trait]
impl SecurityGroupClient for SimulatedCloud {
    async fn create_for_instance(&self, instance_id: &str) -> Result<SecurityGroup, ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("create_security_group", instance_id)?;
        let group = SecurityGroup {
            id: state.next_id("secgroup"),
            name: format!("SecGroup_{}", instance_id),
        };
        state
            .security_groups
            .insert(instance_id.to_string(), group.clone());
        Ok(group)
    }

    async fn create_rule(
        &self,
        group_id: &str,
        protocol: &str,
        from_port: u16,
        to_port: u16,
        cidr: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter(
            "create_security_group_rule",
            &format!("{}:{}:{}-{}", group_id, protocol, from_port, to_port),
        )?;
        state
            .rules
            .entry(group_id.to_string())
            .or_default()
            .push(SimulatedRule {
                protocol: protocol.to_string(),
                from_port,
                to_port,
                cidr: cidr.to_string(),
            });
        Ok(())
    }
}

#[async_trait]
impl OrchestrationClient for SimulatedCloud {
    async fn create_stack(
        &self,
        name: &str,
        _template: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("create_stack", name)?;

        let param = |key: &str| {
            parameters
                .get(key)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };
        let request = ServerCreateRequest {
            name: param("InstanceId"),
            image_id: param("ImageId"),
            flavor_id: param("Flavor"),
            files: BTreeMap::new(),
            security_groups: Vec::new(),
            block_device_mapping: None,
            volume: None,
            availability_zone: parameters
                .get("AvailabilityZone")
                .and_then(Value::as_str)
                .map(str::to_string),
            nics: Vec::new(),
        };
        let volume_size = parameters
            .get("VolumeSize")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let volume = state.new_volume(volume_size, VolumeStatus::InUse);
        let server = state.boot(&request, vec![volume.id.clone()]);

        let resources = HashMap::from([
            (
                "BaseInstance".to_string(),
                StackResource {
                    physical_resource_id: server.id,
                    resource_status: "CREATE_COMPLETE".to_string(),
                },
            ),
            (
                "DataVolume".to_string(),
                StackResource {
                    physical_resource_id: volume.id,
                    resource_status: "CREATE_COMPLETE".to_string(),
                },
            ),
        ]);
        let id = state.next_id("stack");
        state.stacks.insert(
            name.to_string(),
            SimStack {
                stack: Stack {
                    id,
                    action: "CREATE".to_string(),
                    status: "CREATE_IN_PROGRESS".to_string(),
                },
                pending: VecDeque::from(["CREATE_COMPLETE".to_string()]),
                resources,
            },
        );
        Ok(())
    }

    async fn get_stack(&self, name: &str) -> Result<Stack, ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("get_stack", name)?;
        let sim = state
            .stacks
            .get_mut(name)
            .ok_or_else(|| ProviderError::not_found("stack", name))?;
        if let Some(status) = sim.pending.pop_front() {
            sim.stack.status = status;
        }
        Ok(sim.stack.clone())
    }

    async fn get_resource(
        &self,
        stack_id: &str,
        resource_name: &str,
    ) -> Result<StackResource, ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("get_resource", &format!("{}:{}", stack_id, resource_name))?;
        state
            .stacks
            .values()
            .find(|s| s.stack.id == stack_id)
            .and_then(|s| s.resources.get(resource_name))
            .cloned()
            .ok_or_else(|| ProviderError::not_found("stack resource", resource_name))
    }

    async fn delete_stack(&self, name: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.enter("delete_stack", name)?;
        let sim = state
            .stacks
            .remove(name)
            .ok_or_else(|| ProviderError::not_found("stack", name))?;
        for resource in sim.resources.values() {
            state.servers.remove(&resource.physical_resource_id);
            state.volumes.remove(&resource.physical_resource_id);
        }
        Ok(())
    }
}

#[derive(Default)]
struct GuestState {
    calls: Vec<String>,
    failures: HashMap<String, GuestError>,
    hanging: HashSet<String>,
    muted: HashSet<String>,
    prepare_status: Option<ServiceStatus>,
}

/// Simulated guest agent.
///
/// Reports datastore state changes straight into the record store, the way
/// a real agent's heartbeats would: `stop_db` leaves the service `shutdown`,
/// starts and restarts leave it `running`.
pub struct SimulatedGuest {
    persistence: Arc<dyn Persistence>,
    state: Mutex<GuestState>,
}

impl SimulatedGuest {
    /// Create a guest reporting into `persistence`. `prepare` reports `running`.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            state: Mutex::new(GuestState {
                prepare_status: Some(ServiceStatus::Running),
                ..GuestState::default()
            }),
        }
    }

    /// Status reported after `prepare`. `None` leaves the status untouched.
    pub async fn set_prepare_status(&self, status: Option<ServiceStatus>) {
        self.state.lock().await.prepare_status = status;
    }

    /// Make every call of `method` fail with `err` until cleared.
    pub async fn fail(&self, method: &str, err: GuestError) {
        self.state
            .lock()
            .await
            .failures
            .insert(method.to_string(), err);
    }

    /// Stop failing `method`.
    pub async fn clear_failure(&self, method: &str) {
        self.state.lock().await.failures.remove(method);
    }

    /// Make every call of `method` never answer.
    pub async fn hang(&self, method: &str) {
        self.state.lock().await.hanging.insert(method.to_string());
    }

    /// Let `method` succeed without reporting a service status.
    pub async fn mute(&self, method: &str) {
        self.state.lock().await.muted.insert(method.to_string());
    }

    /// All calls made so far, as `method:instance_id`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    /// Number of calls of `method`.
    pub async fn call_count(&self, method: &str) -> usize {
        let prefix = format!("{}:", method);
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    async fn enter(&self, method: &'static str, instance_id: &str) -> Result<(), GuestError> {
        let hang = {
            let mut state = self.state.lock().await;
            state.calls.push(format!("{}:{}", method, instance_id));
            if let Some(err) = state.failures.get(method) {
                return Err(err.clone());
            }
            state.hanging.contains(method)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn report(
        &self,
        method: &'static str,
        instance_id: &str,
        status: ServiceStatus,
    ) -> Result<(), GuestError> {
        if self.state.lock().await.muted.contains(method) {
            return Ok(());
        }
        self.persistence
            .set_service_status(instance_id, status)
            .await
            .map_err(|e| GuestError::Remote {
                method,
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl GuestClient for SimulatedGuest {
    async fn prepare(&self, instance_id: &str, _request: &PrepareRequest) -> Result<(), GuestError> {
        self.enter("prepare", instance_id).await?;
        let status = self.state.lock().await.prepare_status;
        match status {
            Some(status) => self.report("prepare", instance_id, status).await,
            None => Ok(()),
        }
    }

    async fn stop_db(&self, instance_id: &str, _do_not_start_on_reboot: bool)
    -> Result<(), GuestError> {
        self.enter("stop_db", instance_id).await?;
        self.report("stop_db", instance_id, ServiceStatus::Shutdown)
            .await
    }

    async fn restart(&self, instance_id: &str) -> Result<(), GuestError> {
        self.enter("restart", instance_id).await?;
        self.report("restart", instance_id, ServiceStatus::Running)
            .await
    }

    async fn start_db_with_conf_changes(
        &self,
        instance_id: &str,
        _config_contents: &str,
    ) -> Result<(), GuestError> {
        self.enter("start_db_with_conf_changes", instance_id).await?;
        self.report(
            "start_db_with_conf_changes",
            instance_id,
            ServiceStatus::Running,
        )
        .await
    }

    async fn reset_configuration(
        &self,
        instance_id: &str,
        _config_contents: &str,
    ) -> Result<(), GuestError> {
        self.enter("reset_configuration", instance_id).await
    }

    async fn mount_volume(
        &self,
        instance_id: &str,
        _device_path: &str,
        _mount_point: &str,
    ) -> Result<(), GuestError> {
        self.enter("mount_volume", instance_id).await
    }

    async fn unmount_volume(
        &self,
        instance_id: &str,
        _device_path: &str,
        _mount_point: &str,
    ) -> Result<(), GuestError> {
        self.enter("unmount_volume", instance_id).await
    }

    async fn resize_fs(
        &self,
        instance_id: &str,
        _device_path: &str,
        _mount_point: &str,
    ) -> Result<(), GuestError> {
        self.enter("resize_fs", instance_id).await
    }

    async fn create_backup(&self, instance_id: &str, _backup_info: &BackupInfo)
    -> Result<(), GuestError> {
        self.enter("create_backup", instance_id).await
    }

    async fn update_overrides(
        &self,
        instance_id: &str,
        _overrides: &str,
        _remove: bool,
    ) -> Result<(), GuestError> {
        self.enter("update_overrides", instance_id).await
    }

    async fn apply_overrides(
        &self,
        instance_id: &str,
        _overrides: &BTreeMap<String, Value>,
    ) -> Result<(), GuestError> {
        self.enter("apply_overrides", instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(flavor_id: &str) -> ServerCreateRequest {
        ServerCreateRequest {
            name: "inst-1".to_string(),
            image_id: "img".to_string(),
            flavor_id: flavor_id.to_string(),
            files: BTreeMap::new(),
            security_groups: Vec::new(),
            block_device_mapping: None,
            volume: None,
            availability_zone: None,
            nics: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_server_boots_then_resizes() {
        let cloud = SimulatedCloud::new();
        let server = cloud.create_server(&request("2")).await.unwrap();
        assert_eq!(server.status, ServerStatus::Build);
        assert_eq!(
            cloud.get_server(&server.id).await.unwrap().status,
            ServerStatus::Active
        );

        cloud.resize_server(&server.id, "3").await.unwrap();
        assert_eq!(
            cloud.get_server(&server.id).await.unwrap().status,
            ServerStatus::Resize
        );
        let verified = cloud.get_server(&server.id).await.unwrap();
        assert_eq!(verified.status, ServerStatus::VerifyResize);
        assert_eq!(verified.flavor_id, "3");

        cloud.revert_resize(&server.id).await.unwrap();
        let reverted = cloud.get_server(&server.id).await.unwrap();
        assert_eq!(reverted.status, ServerStatus::Active);
        assert_eq!(reverted.flavor_id, "2");
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let cloud = SimulatedCloud::new();
        cloud
            .fail("create_server", ProviderError::remote(500, "no capacity"))
            .await;
        let err = cloud.create_server(&request("2")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Remote { status: 500, .. }));
        assert_eq!(cloud.call_count("create_server").await, 1);

        cloud.clear_failure("create_server").await;
        assert!(cloud.create_server(&request("2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_extend_stuck() {
        let cloud = SimulatedCloud::new();
        cloud
            .insert_volume(Volume {
                id: "v1".to_string(),
                status: VolumeStatus::Available,
                size: 5,
            })
            .await;
        cloud.set_extend_behavior(ExtendBehavior::StuckExtending).await;
        cloud.extend_volume("v1", 10).await.unwrap();
        let volume = cloud.get_volume("v1").await.unwrap();
        assert_eq!(volume.status, VolumeStatus::Extending);
        assert_eq!(volume.size, 5);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let cloud = SimulatedCloud::new();
        let err = cloud.delete_object("c", "b1.gz").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }
}
