// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared orchestration context and the loaded-instance handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde_json::{Map, Value, json};
use stratus_core::{InstanceRecord, InstanceUpdate, Persistence, ServiceStatus, TaskStatus};
use tracing::debug;

use crate::clients::{Clients, Flavor, Server, ServerStatus, TimedGuest};
use crate::config::Config;
use crate::datastore::DatastoreManager;
use crate::error::{Error, ProviderError, Result};
use crate::notifier::{UsageEvent, UsageNotifier};
use crate::template::ConfigRenderer;

/// Counters exposed by the task manager.
#[derive(Debug, Default)]
pub struct TaskMetrics {
    swallowed_activation_errors: AtomicU64,
}

impl TaskMetrics {
    /// Count an error swallowed by the creation activation step.
    pub fn record_swallowed_activation_error(&self) {
        self.swallowed_activation_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Errors swallowed by the creation activation step so far.
    pub fn swallowed_activation_errors(&self) -> u64 {
        self.swallowed_activation_errors.load(Ordering::Relaxed)
    }
}

/// Everything an orchestration run needs, shared across runs.
#[derive(Clone)]
pub struct TaskContext {
    /// Configuration.
    pub config: Arc<Config>,
    /// Record store.
    pub persistence: Arc<dyn Persistence>,
    /// Remote collaborators.
    pub clients: Clients,
    /// Usage event publisher.
    pub notifier: Arc<dyn UsageNotifier>,
    /// Configuration renderer.
    pub renderer: Arc<ConfigRenderer>,
    /// Counters.
    pub metrics: Arc<TaskMetrics>,
}

impl TaskContext {
    /// Guest client bound to one instance, with configured call timeouts.
    pub fn guest(&self, instance_id: &str) -> TimedGuest {
        TimedGuest::new(
            self.clients.guest.clone(),
            instance_id,
            self.config.agent_call_low_timeout,
            self.config.agent_call_high_timeout,
        )
    }
}

/// An instance record together with its compute server.
pub struct BuiltInstance {
    /// Shared context.
    pub ctx: TaskContext,
    /// Instance record, as last loaded.
    pub record: InstanceRecord,
    /// Compute server, as last fetched.
    pub server: Server,
    /// Datastore manager of the instance.
    pub manager: DatastoreManager,
}

impl BuiltInstance {
    /// Load an instance record and its compute server.
    pub async fn load(ctx: &TaskContext, instance_id: &str) -> Result<Self> {
        Self::load_with(ctx, instance_id, false).await
    }

    /// Like [`load`](Self::load), but a server the provider no longer knows
    /// about is reported as `DELETED` instead of failing.
    pub async fn load_allow_missing_server(ctx: &TaskContext, instance_id: &str) -> Result<Self> {
        Self::load_with(ctx, instance_id, true).await
    }

    async fn load_with(ctx: &TaskContext, instance_id: &str, allow_missing: bool) -> Result<Self> {
        let record = ctx
            .persistence
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        let manager = parse_manager(&record)?;
        let server_id = record.compute_instance_id.clone().ok_or_else(|| {
            Error::Orchestration(format!("Instance {} has no compute server", instance_id))
        })?;
        let server = match ctx.clients.compute.get_server(&server_id).await {
            Ok(server) => server,
            Err(ProviderError::NotFound { .. }) if allow_missing => Server {
                id: server_id.clone(),
                status: ServerStatus::Other("DELETED".to_string()),
                flavor_id: record.flavor_id.clone(),
                addresses: Default::default(),
                availability_zone: None,
                host: None,
                attached_volumes: Vec::new(),
            },
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            ctx: ctx.clone(),
            record,
            server,
            manager,
        })
    }

    /// Instance id.
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Guest client for this instance.
    pub fn guest(&self) -> TimedGuest {
        self.ctx.guest(&self.record.id)
    }

    /// Re-fetch the compute server.
    pub async fn refresh_server(&mut self) -> Result<&Server> {
        self.server = self.ctx.clients.compute.get_server(&self.server.id).await?;
        Ok(&self.server)
    }

    /// Re-read the instance record.
    pub async fn refresh_record(&mut self) -> Result<&InstanceRecord> {
        self.record = self.ctx.persistence.find_instance(&self.record.id).await?;
        Ok(&self.record)
    }

    /// Fetch the server and check whether its status is one of `expected`.
    pub async fn server_status_matches(&mut self, expected: &[ServerStatus]) -> Result<bool> {
        Ok(self.refresh_server().await?.status_matches(expected))
    }

    /// Apply a partial update and re-read the record.
    pub async fn update(&mut self, update: InstanceUpdate) -> Result<()> {
        self.ctx
            .persistence
            .update_instance(&self.record.id, &update)
            .await?;
        self.refresh_record().await?;
        Ok(())
    }

    /// Reset the task status to `NONE`.
    pub async fn reset_task_status(&mut self) -> Result<()> {
        debug!(instance_id = %self.record.id, "Resetting task status to NONE");
        self.update(InstanceUpdate::task_status(TaskStatus::None))
            .await
    }

    /// Guest-reported service status.
    pub async fn service_status(&self) -> Result<Option<ServiceStatus>> {
        Ok(self
            .ctx
            .persistence
            .get_service_status(&self.record.id)
            .await?)
    }

    /// Set the service status.
    pub async fn set_service_status(&self, status: ServiceStatus) -> Result<()> {
        self.ctx
            .persistence
            .set_service_status(&self.record.id, status)
            .await?;
        Ok(())
    }

    /// Whether the instance gets a data volume.
    pub fn volume_support(&self) -> bool {
        volume_support(&self.ctx.config, self.manager)
    }

    /// Device path of the data volume.
    pub fn device_path(&self) -> String {
        device_path(&self.ctx.config, self.manager)
    }

    /// Mount point of the data volume.
    pub fn mount_point(&self) -> String {
        self.ctx.config.datastore(self.manager).mount_point
    }

    /// Publish a usage event of `kind` with the default payload plus `extra`.
    pub async fn send_usage_event(
        &self,
        kind: &str,
        flavor: &Flavor,
        instance_size: Option<i64>,
        extra: Map<String, Value>,
    ) -> Result<()> {
        let payload = usage_payload(
            &self.ctx.config,
            &self.record,
            &self.server,
            self.manager,
            flavor,
            instance_size,
            extra,
        );
        let event = UsageEvent::new(kind, self.ctx.config.host.clone(), payload);
        self.ctx.notifier.notify(event).await
    }
}

/// Parse the datastore manager stored on a record.
pub(crate) fn parse_manager(record: &InstanceRecord) -> Result<DatastoreManager> {
    record.datastore_manager.parse().map_err(|_| {
        Error::Orchestration(format!(
            "Instance {} has unknown datastore manager '{}'",
            record.id, record.datastore_manager
        ))
    })
}

/// Whether volumes are provisioned for `manager`.
pub(crate) fn volume_support(config: &Config, manager: DatastoreManager) -> bool {
    config.volume_support && config.datastore(manager).volume_support
}

/// Device path of the data volume for `manager`.
pub(crate) fn device_path(config: &Config, manager: DatastoreManager) -> String {
    config
        .datastore(manager)
        .device_path
        .unwrap_or_else(|| config.device_path.clone())
}

/// Default usage payload.
pub(crate) fn usage_payload(
    config: &Config,
    record: &InstanceRecord,
    server: &Server,
    manager: DatastoreManager,
    flavor: &Flavor,
    instance_size: Option<i64>,
    extra: Map<String, Value>,
) -> Map<String, Value> {
    let now = Utc::now().to_rfc3339();
    let mut payload = Map::new();
    payload.insert(
        "availability_zone".to_string(),
        json!(server.availability_zone),
    );
    payload.insert(
        "created_at".to_string(),
        json!(record.created_at.to_rfc3339()),
    );
    payload.insert("name".to_string(), json!(record.name));
    payload.insert("instance_id".to_string(), json!(record.id));
    payload.insert("instance_name".to_string(), json!(record.name));
    payload.insert(
        "instance_size".to_string(),
        json!(instance_size.unwrap_or(flavor.ram)),
    );
    payload.insert("instance_type".to_string(), json!(flavor.name));
    payload.insert("instance_type_id".to_string(), json!(flavor.id));
    payload.insert("launched_at".to_string(), json!(now));
    payload.insert("nova_instance_id".to_string(), json!(server.id));
    payload.insert("region".to_string(), json!(config.region));
    payload.insert(
        "state_description".to_string(),
        json!(server.status.as_str().to_lowercase()),
    );
    payload.insert(
        "state".to_string(),
        json!(server.status.as_str().to_lowercase()),
    );
    payload.insert("tenant_id".to_string(), json!(record.tenant_id));
    if volume_support(config, manager) {
        payload.insert("volume_size".to_string(), json!(record.volume_size));
        payload.insert("nova_volume_id".to_string(), json!(record.volume_id));
    }
    payload.insert("service_id".to_string(), json!(config.service_id(manager)));
    payload.extend(extra);
    payload
}
