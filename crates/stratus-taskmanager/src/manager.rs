// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task dispatch.
//!
//! [`TaskManager::dispatch`] runs one [`TaskMessage`] to completion and then
//! makes sure the instance's task status is terminal: `NONE`,
//! `RESTART_REQUIRED` or a specific error. A create that fails while still
//! `BUILDING` is flagged `BUILDING_ERROR_SERVER`; any other busy status is
//! reset to `NONE`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratus_core::{Persistence, TaskStatus};
use tracing::{error, info, warn};

use crate::backup;
use crate::clients::{BackupInfo, Clients, Flavor};
use crate::config::Config;
use crate::create::{self, CreateInstanceRequest};
use crate::error::{Error, Result};
use crate::instance::{BuiltInstance, TaskContext, TaskMetrics};
use crate::lifecycle;
use crate::notifier::UsageNotifier;
use crate::resize::{self, MigrateAction, ResizeFlavorAction};
use crate::template::ConfigRenderer;
use crate::volume_resize;

/// A unit of work for the task manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskMessage {
    /// Build a new instance.
    CreateInstance(CreateInstanceRequest),
    /// Resize the server to another flavor.
    ResizeFlavor {
        /// Instance to resize.
        instance_id: String,
        /// Current flavor.
        old_flavor: Flavor,
        /// Requested flavor.
        new_flavor: Flavor,
    },
    /// Move the server to another host.
    Migrate {
        /// Instance to migrate.
        instance_id: String,
        /// Target host.
        #[serde(default)]
        host: Option<String>,
    },
    /// Grow the data volume.
    ResizeVolume {
        /// Instance to resize.
        instance_id: String,
        /// Requested size in GB.
        new_size: i64,
    },
    /// Reboot the server.
    Reboot {
        /// Instance to reboot.
        instance_id: String,
    },
    /// Restart the datastore.
    Restart {
        /// Instance to restart.
        instance_id: String,
    },
    /// Delete the instance.
    DeleteInstance {
        /// Instance to delete.
        instance_id: String,
    },
    /// Take a backup.
    CreateBackup {
        /// Instance to back up.
        instance_id: String,
        /// Backup to produce.
        backup_info: BackupInfo,
    },
    /// Delete a backup.
    DeleteBackup {
        /// Backup to delete.
        backup_id: String,
    },
    /// Change configuration overrides.
    UpdateOverrides {
        /// Instance to configure.
        instance_id: String,
        /// Overrides to apply.
        overrides: BTreeMap<String, Value>,
        /// Remove instead of apply.
        #[serde(default)]
        remove: bool,
    },
}

impl TaskMessage {
    /// Task name, as used in the `task` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateInstance(_) => "create_instance",
            Self::ResizeFlavor { .. } => "resize_flavor",
            Self::Migrate { .. } => "migrate",
            Self::ResizeVolume { .. } => "resize_volume",
            Self::Reboot { .. } => "reboot",
            Self::Restart { .. } => "restart",
            Self::DeleteInstance { .. } => "delete_instance",
            Self::CreateBackup { .. } => "create_backup",
            Self::DeleteBackup { .. } => "delete_backup",
            Self::UpdateOverrides { .. } => "update_overrides",
        }
    }

    /// Instance the task operates on, if any.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::CreateInstance(request) => Some(&request.instance_id),
            Self::ResizeFlavor { instance_id, .. }
            | Self::Migrate { instance_id, .. }
            | Self::ResizeVolume { instance_id, .. }
            | Self::Reboot { instance_id }
            | Self::Restart { instance_id }
            | Self::DeleteInstance { instance_id }
            | Self::CreateBackup { instance_id, .. }
            | Self::UpdateOverrides { instance_id, .. } => Some(instance_id),
            Self::DeleteBackup { .. } => None,
        }
    }
}

/// Runs task messages against the configured collaborators.
#[derive(Clone)]
pub struct TaskManager {
    ctx: TaskContext,
}

impl TaskManager {
    /// Create a task manager.
    pub fn new(
        config: Config,
        persistence: Arc<dyn Persistence>,
        clients: Clients,
        notifier: Arc<dyn UsageNotifier>,
    ) -> Self {
        Self {
            ctx: TaskContext {
                config: Arc::new(config),
                persistence,
                clients,
                notifier,
                renderer: Arc::new(ConfigRenderer::new()),
                metrics: Arc::new(TaskMetrics::default()),
            },
        }
    }

    /// Shared orchestration context.
    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// Errors swallowed by the creation activation step so far.
    pub fn swallowed_activation_errors(&self) -> u64 {
        self.ctx.metrics.swallowed_activation_errors()
    }

    /// Run one task to completion.
    pub async fn dispatch(&self, message: TaskMessage) -> Result<()> {
        let task = message.name();
        info!(task, instance_id = ?message.instance_id(), "Dispatching task");

        let result = match (self.run(&message).await, &message) {
            (Err(Error::BackupNotFound(id)), TaskMessage::DeleteBackup { .. }) => {
                info!(backup_id = %id, "Backup already deleted");
                Ok(())
            }
            (result, _) => result,
        };

        if let Some(instance_id) = message.instance_id() {
            let is_create = matches!(message, TaskMessage::CreateInstance(_));
            self.ensure_terminal_status(instance_id, is_create, result.is_ok())
                .await;
        }

        match &result {
            Ok(()) => info!(task, instance_id = ?message.instance_id(), "Task complete"),
            Err(e) => error!(
                task,
                instance_id = ?message.instance_id(),
                error = %e,
                "Task failed"
            ),
        }
        result
    }

    async fn run(&self, message: &TaskMessage) -> Result<()> {
        let ctx = &self.ctx;
        match message {
            TaskMessage::CreateInstance(request) => create::create_instance(ctx, request).await,
            TaskMessage::ResizeFlavor {
                instance_id,
                old_flavor,
                new_flavor,
            } => {
                let mut instance = BuiltInstance::load(ctx, instance_id).await?;
                let action = ResizeFlavorAction {
                    old_flavor: old_flavor.clone(),
                    new_flavor: new_flavor.clone(),
                };
                resize::execute(&mut instance, &action).await
            }
            TaskMessage::Migrate { instance_id, host } => {
                let mut instance = BuiltInstance::load(ctx, instance_id).await?;
                let flavor = ctx
                    .clients
                    .compute
                    .get_flavor(&instance.record.flavor_id)
                    .await?;
                let action = MigrateAction {
                    host: host.clone(),
                    flavor,
                };
                resize::execute(&mut instance, &action).await
            }
            TaskMessage::ResizeVolume {
                instance_id,
                new_size,
            } => {
                let mut instance = BuiltInstance::load(ctx, instance_id).await?;
                volume_resize::execute(&mut instance, *new_size).await
            }
            TaskMessage::Reboot { instance_id } => {
                let mut instance = BuiltInstance::load(ctx, instance_id).await?;
                lifecycle::reboot(&mut instance).await
            }
            TaskMessage::Restart { instance_id } => {
                let mut instance = BuiltInstance::load(ctx, instance_id).await?;
                lifecycle::restart(&mut instance).await
            }
            TaskMessage::DeleteInstance { instance_id } => {
                let mut instance = BuiltInstance::load_allow_missing_server(ctx, instance_id).await?;
                lifecycle::delete_instance(&mut instance).await
            }
            TaskMessage::CreateBackup {
                instance_id,
                backup_info,
            } => {
                let instance = BuiltInstance::load(ctx, instance_id).await?;
                backup::create_backup(&instance, backup_info).await
            }
            TaskMessage::DeleteBackup { backup_id } => backup::delete_backup(ctx, backup_id).await,
            TaskMessage::UpdateOverrides {
                instance_id,
                overrides,
                remove,
            } => {
                let mut instance = BuiltInstance::load(ctx, instance_id).await?;
                lifecycle::update_overrides(&mut instance, overrides, *remove).await
            }
        }
    }

    async fn ensure_terminal_status(&self, instance_id: &str, is_create: bool, succeeded: bool) {
        let record = match self.ctx.persistence.get_instance(instance_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                error!(instance_id, error = %e, "Failed to read task status");
                return;
            }
        };
        if record.task_status.is_terminal() {
            return;
        }

        let status = if !succeeded && is_create && record.task_status == TaskStatus::Building {
            TaskStatus::BuildingErrorServer
        } else {
            TaskStatus::None
        };
        warn!(
            instance_id,
            from = ?record.task_status,
            to = ?status,
            "Task left a busy status behind, resetting"
        );
        if let Err(e) = self.ctx.persistence.set_task_status(instance_id, status).await {
            error!(instance_id, error = %e, "Failed to reset task status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_format() {
        let message: TaskMessage = serde_json::from_value(json!({
            "task": "resize_volume",
            "instance_id": "i1",
            "new_size": 10
        }))
        .unwrap();
        assert_eq!(
            message,
            TaskMessage::ResizeVolume {
                instance_id: "i1".to_string(),
                new_size: 10
            }
        );
        assert_eq!(message.name(), "resize_volume");
        assert_eq!(message.instance_id(), Some("i1"));
    }

    #[test]
    fn test_create_message_is_flattened() {
        let message: TaskMessage = serde_json::from_value(json!({
            "task": "create_instance",
            "instance_id": "i1",
            "flavor": {"id": "2", "name": "m1.small", "ram": 512},
            "image_id": "img1",
            "datastore_manager": "mysql"
        }))
        .unwrap();
        assert_eq!(message.name(), "create_instance");
        assert_eq!(message.instance_id(), Some("i1"));
    }

    #[test]
    fn test_delete_backup_has_no_instance() {
        let message = TaskMessage::DeleteBackup {
            backup_id: "b1".to_string(),
        };
        assert_eq!(message.instance_id(), None);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["task"], "delete_backup");
    }
}
