// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stratus-taskmanager integration tests.
//!
//! Provides TestContext wiring an in-memory record store, the simulated
//! cloud and guest, and a recording notifier into a TaskManager with
//! millisecond timeouts.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use stratus_core::{
    InstanceRecord, InstanceUpdate, NewInstance, Persistence, ServiceStatus, SqlitePersistence,
    TaskStatus,
};
use stratus_taskmanager::clients::{Flavor, Server, ServerStatus, Volume, VolumeStatus};
use stratus_taskmanager::{
    Config, CreateInstanceRequest, DatastoreManager, RecordingNotifier, SimulatedCloud,
    SimulatedGuest, TaskManager,
};

/// Config with timeouts short enough for tests.
pub fn fast_config() -> Config {
    let timeout = Duration::from_millis(300);
    let tick = Duration::from_millis(5);
    let mut config = Config {
        volume_time_out: timeout,
        dns_time_out: timeout,
        resize_time_out: timeout,
        revert_time_out: timeout,
        heat_time_out: timeout,
        reboot_time_out: timeout,
        server_delete_time_out: timeout,
        usage_sleep_time: tick,
        poll_interval: tick,
        dns_poll_interval: tick,
        agent_call_low_timeout: Duration::from_millis(200),
        agent_call_high_timeout: Duration::from_millis(200),
        ..Config::default()
    };
    for section in config.datastores.values_mut() {
        section.usage_timeout = timeout;
    }
    config
}

/// Test context shared by the integration tests.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub cloud: Arc<SimulatedCloud>,
    pub guest: Arc<SimulatedGuest>,
    pub notifier: Arc<RecordingNotifier>,
    pub manager: TaskManager,
}

impl TestContext {
    /// Context with [`fast_config`].
    pub async fn new() -> Self {
        Self::with_config(fast_config()).await
    }

    /// Context with a custom config.
    pub async fn with_config(config: Config) -> Self {
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("Failed to open in-memory database"),
        );
        let cloud = Arc::new(SimulatedCloud::new());
        let guest = Arc::new(SimulatedGuest::new(persistence.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let clients = cloud.clone().into_clients(guest.clone());
        let manager = TaskManager::new(config, persistence.clone(), clients, notifier.clone());
        Self {
            persistence,
            cloud,
            guest,
            notifier,
            manager,
        }
    }

    /// Insert a `BUILDING` record, as the API layer does before a create.
    pub async fn create_building_record(&self, instance_id: &str, request: &CreateInstanceRequest) {
        self.persistence
            .create_instance(&NewInstance {
                id: instance_id.to_string(),
                name: format!("{}-name", instance_id),
                tenant_id: "tenant-1".to_string(),
                hostname: None,
                flavor_id: request.flavor.id.clone(),
                datastore_manager: request.datastore_manager.to_string(),
                volume_size: request.volume_size,
                task_status: TaskStatus::Building,
            })
            .await
            .expect("Failed to create instance record");
    }

    /// Seed an instance that is up: `ACTIVE` server with an attached
    /// volume, service `RUNNING`, task status `task_status`.
    pub async fn seed_active_instance(
        &self,
        instance_id: &str,
        manager: DatastoreManager,
        flavor_id: &str,
        volume_size: i64,
        task_status: TaskStatus,
    ) -> InstanceRecord {
        let server_id = format!("server-{}", instance_id);
        let volume_id = format!("volume-{}", instance_id);

        let mut addresses = BTreeMap::new();
        addresses.insert("private".to_string(), vec!["10.0.0.9".to_string()]);
        self.cloud
            .insert_server(Server {
                id: server_id.clone(),
                status: ServerStatus::Active,
                flavor_id: flavor_id.to_string(),
                addresses,
                availability_zone: Some("nova".to_string()),
                host: Some("compute-1".to_string()),
                attached_volumes: vec![volume_id.clone()],
            })
            .await;
        self.cloud
            .insert_volume(Volume {
                id: volume_id.clone(),
                status: VolumeStatus::InUse,
                size: volume_size,
            })
            .await;

        self.persistence
            .create_instance(&NewInstance {
                id: instance_id.to_string(),
                name: format!("{}-name", instance_id),
                tenant_id: "tenant-1".to_string(),
                hostname: None,
                flavor_id: flavor_id.to_string(),
                datastore_manager: manager.to_string(),
                volume_size: Some(volume_size),
                task_status,
            })
            .await
            .expect("Failed to create instance record");
        self.persistence
            .update_instance(
                instance_id,
                &InstanceUpdate {
                    compute_instance_id: Some(server_id),
                    volume_id: Some(volume_id),
                    ..Default::default()
                },
            )
            .await
            .expect("Failed to update instance record");
        self.persistence
            .set_service_status(instance_id, ServiceStatus::Running)
            .await
            .expect("Failed to set service status");

        self.record(instance_id).await
    }

    /// Current instance record.
    pub async fn record(&self, instance_id: &str) -> InstanceRecord {
        self.persistence
            .find_instance(instance_id)
            .await
            .expect("Instance record missing")
    }

    /// Current task status.
    pub async fn task_status(&self, instance_id: &str) -> TaskStatus {
        self.record(instance_id).await.task_status
    }

    /// Current service status.
    pub async fn service_status(&self, instance_id: &str) -> Option<ServiceStatus> {
        self.persistence
            .get_service_status(instance_id)
            .await
            .expect("Failed to read service status")
    }
}

/// Flavor as sent in task messages.
pub fn flavor(id: &str, ram: i64) -> Flavor {
    Flavor {
        id: id.to_string(),
        name: format!("flavor-{}", id),
        ram,
    }
}

/// Create request for a mysql instance.
pub fn create_request(instance_id: &str) -> CreateInstanceRequest {
    CreateInstanceRequest {
        instance_id: instance_id.to_string(),
        name: format!("{}-name", instance_id),
        tenant_id: "tenant-1".to_string(),
        hostname: None,
        flavor: flavor("2", 512),
        image_id: "img1".to_string(),
        datastore_manager: DatastoreManager::Mysql,
        databases: Vec::new(),
        users: Vec::new(),
        packages: Vec::new(),
        volume_size: Some(1),
        backup_id: None,
        availability_zone: None,
        root_password: None,
        nics: Vec::new(),
        overrides: BTreeMap::new(),
    }
}
