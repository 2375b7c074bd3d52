// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record store interfaces and backends.
//!
//! The task manager treats persistence as a key-value store keyed by
//! instance (or backup) id with atomic single-row updates. Only one
//! orchestration run touches a given instance at a time, so read-modify-write
//! without external locking is sufficient.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::service_status::ServiceStatus;
use crate::tasks::TaskStatus;

/// Persisted instance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique identifier for the instance.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Optional hostname requested for the compute server.
    pub hostname: Option<String>,
    /// Compute server backing the instance, once booted.
    pub compute_instance_id: Option<String>,
    /// Block volume attached to the instance, once provisioned.
    pub volume_id: Option<String>,
    /// Current flavor.
    pub flavor_id: String,
    /// Datastore manager name (mysql, redis, ...).
    pub datastore_manager: String,
    /// Volume size in GB.
    pub volume_size: Option<i64>,
    /// What the task manager is currently doing to this instance.
    pub task_status: TaskStatus,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last modified.
    pub updated_at: DateTime<Utc>,
    /// When the instance was deleted, if it was.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields needed to create an instance row.
#[derive(Debug, Clone)]
pub struct NewInstance {
    /// Unique identifier for the instance.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Optional hostname.
    pub hostname: Option<String>,
    /// Requested flavor.
    pub flavor_id: String,
    /// Datastore manager name.
    pub datastore_manager: String,
    /// Requested volume size in GB.
    pub volume_size: Option<i64>,
    /// Initial task status (normally `Building`).
    pub task_status: TaskStatus,
}

/// Partial update of an instance row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    /// New compute server id.
    pub compute_instance_id: Option<String>,
    /// New volume id.
    pub volume_id: Option<String>,
    /// New flavor id.
    pub flavor_id: Option<String>,
    /// New volume size.
    pub volume_size: Option<i64>,
    /// New task status.
    pub task_status: Option<TaskStatus>,
}

impl InstanceUpdate {
    /// Update only the task status.
    pub fn task_status(status: TaskStatus) -> Self {
        Self {
            task_status: Some(status),
            ..Default::default()
        }
    }
}

/// Lifecycle state of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupState {
    /// Backup requested.
    New,
    /// Guest is producing the backup.
    Building,
    /// Backup is being uploaded.
    Saving,
    /// Backup stored.
    Completed,
    /// Backup failed.
    Failed,
    /// Deleting the stored objects failed; the row is kept for a retry.
    DeleteFailed,
}

impl BackupState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Building => "BUILDING",
            Self::Saving => "SAVING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::DeleteFailed => "DELETE_FAILED",
        }
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NEW" => Self::New,
            "BUILDING" => Self::Building,
            "SAVING" => Self::Saving,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "DELETE_FAILED" => Self::DeleteFailed,
            other => {
                return Err(CoreError::CorruptRecord {
                    table: "backups",
                    details: format!("unknown state '{}'", other),
                });
            }
        })
    }
}

/// Persisted backup row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Unique identifier for the backup.
    pub id: String,
    /// Instance the backup was taken from.
    pub instance_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Display name.
    pub name: String,
    /// Object-store URL of the backup object, once stored.
    pub location: Option<String>,
    /// Backup strategy name (e.g. `InnoBackupEx`).
    pub backup_type: Option<String>,
    /// Checksum of the stored object.
    pub checksum: Option<String>,
    /// Current state.
    pub state: BackupState,
    /// When the backup was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last modified.
    pub updated_at: DateTime<Utc>,
}

impl BackupRecord {
    /// Object name of the stored backup: the last path segment of `location`.
    pub fn filename(&self) -> Option<&str> {
        self.location
            .as_deref()
            .and_then(|loc| loc.rsplit('/').next())
            .filter(|name| !name.is_empty())
    }
}

/// Fields needed to create a backup row.
#[derive(Debug, Clone)]
pub struct NewBackup {
    /// Unique identifier for the backup.
    pub id: String,
    /// Instance the backup is taken from.
    pub instance_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Display name.
    pub name: String,
    /// Object-store URL, if already known.
    pub location: Option<String>,
    /// Backup strategy name.
    pub backup_type: Option<String>,
    /// Checksum of the stored object.
    pub checksum: Option<String>,
    /// Initial state.
    pub state: BackupState,
}

/// Record store used by the task manager.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Create an instance row. Also seeds its service status as `New`.
    async fn create_instance(&self, instance: &NewInstance) -> Result<InstanceRecord, CoreError>;

    /// Get an instance by ID.
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError>;

    /// Get an instance by ID, failing with `InstanceNotFound` when absent.
    async fn find_instance(&self, instance_id: &str) -> Result<InstanceRecord, CoreError> {
        self.get_instance(instance_id)
            .await?
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    /// Atomically apply a partial update to one instance row.
    async fn update_instance(
        &self,
        instance_id: &str,
        update: &InstanceUpdate,
    ) -> Result<(), CoreError>;

    /// Set the task status of an instance.
    async fn set_task_status(&self, instance_id: &str, status: TaskStatus) -> Result<(), CoreError> {
        self.update_instance(instance_id, &InstanceUpdate::task_status(status))
            .await
    }

    /// Stamp an instance as deleted.
    async fn delete_instance(&self, instance_id: &str) -> Result<(), CoreError>;

    /// Get the guest-reported service status.
    async fn get_service_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<ServiceStatus>, CoreError>;

    /// Set the service status (insert or replace).
    async fn set_service_status(
        &self,
        instance_id: &str,
        status: ServiceStatus,
    ) -> Result<(), CoreError>;

    /// Create a backup row.
    async fn create_backup(&self, backup: &NewBackup) -> Result<BackupRecord, CoreError>;

    /// Get a backup by ID.
    async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>, CoreError>;

    /// Update the state of a backup.
    async fn update_backup_state(
        &self,
        backup_id: &str,
        state: BackupState,
    ) -> Result<(), CoreError>;

    /// Delete a backup row, failing with `BackupNotFound` when absent.
    async fn delete_backup(&self, backup_id: &str) -> Result<(), CoreError>;

    /// Record that the root user was enabled on an instance.
    async fn record_root_enabled(&self, instance_id: &str, user: &str) -> Result<(), CoreError>;

    /// Whether the root user has ever been enabled on an instance.
    async fn root_enabled(&self, instance_id: &str) -> Result<bool, CoreError>;

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
