// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reboot, restart, delete and configuration override tasks.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use stratus_core::{InstanceUpdate, ServiceStatus, TaskStatus};
use tracing::{error, info, warn};

use crate::clients::ServerStatus;
use crate::config::ProvisioningStrategy;
use crate::error::{Error, ProviderError, Result};
use crate::instance::BuiltInstance;
use crate::poll::{poll_until, poll_until_true};

/// Reboot the server under a stopped datastore.
///
/// Failures are logged, not returned; the task status ends at `NONE`.
pub async fn reboot(instance: &mut BuiltInstance) -> Result<()> {
    info!(instance_id = %instance.id(), "Rebooting instance");
    if let Err(e) = reboot_server(instance).await {
        error!(instance_id = %instance.id(), error = %e, "Failed to reboot instance");
    }
    instance.reset_task_status().await
}

async fn reboot_server(instance: &BuiltInstance) -> Result<()> {
    // A crashed datastore cannot answer stop_db.
    if let Err(e) = instance.guest().stop_db(false).await {
        warn!(instance_id = %instance.id(), error = %e, "Failed to stop datastore before reboot");
    }
    let status = instance.service_status().await?;
    if !matches!(status, Some(ServiceStatus::Shutdown | ServiceStatus::Crashed)) {
        warn!(
            instance_id = %instance.id(),
            status = ?status,
            "Datastore still up, not rebooting"
        );
        return Ok(());
    }

    let compute = &instance.ctx.clients.compute;
    let server_id = instance.server.id.as_str();
    compute.reboot_server(server_id).await?;

    poll_until(
        move || async move { Ok::<_, Error>(compute.get_server(server_id).await?) },
        |server| Ok(server.status == ServerStatus::Active),
        instance.ctx.config.poll_interval,
        instance.ctx.config.reboot_time_out,
    )
    .await?;

    // The guest reports RUNNING once the datastore comes back up.
    instance.set_service_status(ServiceStatus::Paused).await?;
    info!(instance_id = %instance.id(), "Rebooted instance");
    Ok(())
}

/// Restart the datastore. Guest failures are logged, not returned.
pub async fn restart(instance: &mut BuiltInstance) -> Result<()> {
    info!(instance_id = %instance.id(), "Restarting datastore");
    if let Err(e) = instance.guest().restart().await {
        error!(instance_id = %instance.id(), error = %e, "Failed to restart datastore");
    }
    instance.reset_task_status().await
}

/// Tear down the instance's server and mark the record deleted.
pub async fn delete_instance(instance: &mut BuiltInstance) -> Result<()> {
    info!(instance_id = %instance.id(), "Deleting instance");
    let ctx = instance.ctx.clone();
    let config = ctx.config.clone();

    if config.provisioning_strategy() == ProvisioningStrategy::Heat {
        let stack_name = format!("stratus-{}", instance.id());
        match ctx.clients.orchestration.delete_stack(&stack_name).await {
            Ok(()) | Err(ProviderError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    } else {
        match ctx.clients.compute.delete_server(&instance.server.id).await {
            Ok(()) | Err(ProviderError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    if config.dns_support
        && let Err(e) = ctx.clients.dns.delete_instance_entry(instance.id()).await
    {
        error!(instance_id = %instance.id(), error = %e, "Failed to delete DNS entry");
    }

    let compute = &ctx.clients.compute;
    let server_id = instance.server.id.as_str();
    let gone = poll_until_true(
        move || async move {
            match compute.get_server(server_id).await {
                Ok(_) => Ok(false),
                Err(ProviderError::NotFound { .. }) => Ok(true),
                Err(e) => Err(Error::from(e)),
            }
        },
        config.poll_interval,
        config.server_delete_time_out,
    )
    .await;
    if let Err(e) = gone {
        warn!(
            instance_id = %instance.id(),
            error = %e,
            "Server was not deleted in time"
        );
    }

    match ctx.clients.compute.get_flavor(&instance.record.flavor_id).await {
        Ok(flavor) => {
            let mut extra = Map::new();
            extra.insert(
                "deleted_at".to_string(),
                Value::String(chrono::Utc::now().to_rfc3339()),
            );
            instance
                .send_usage_event("delete", &flavor, None, extra)
                .await?;
        }
        Err(e) => {
            error!(instance_id = %instance.id(), error = %e, "Failed to send delete usage event");
        }
    }

    instance.reset_task_status().await?;
    ctx.persistence.delete_instance(instance.id()).await?;
    info!(instance_id = %instance.id(), "Instance deleted");
    Ok(())
}

/// Push configuration overrides to the guest.
///
/// Marks the instance `RESTART_REQUIRED` when any key only takes effect
/// after a restart. Guest failures are logged, not returned.
pub async fn update_overrides(
    instance: &mut BuiltInstance,
    overrides: &BTreeMap<String, Value>,
    remove: bool,
) -> Result<()> {
    let renderer = instance.ctx.renderer.clone();
    let restart_required = overrides
        .keys()
        .any(|key| renderer.requires_restart(instance.manager, key));
    if restart_required {
        instance
            .update(InstanceUpdate::task_status(TaskStatus::RestartRequired))
            .await?;
    }

    let rendered = renderer.render_overrides(instance.manager, overrides);
    let guest = instance.guest();
    let pushed = match guest.update_overrides(&rendered, remove).await {
        Ok(()) if !remove => guest.apply_overrides(overrides).await,
        other => other,
    };
    if let Err(e) = pushed {
        error!(instance_id = %instance.id(), error = %e, "Failed to update overrides");
    }
    info!(
        instance_id = %instance.id(),
        keys = overrides.len(),
        restart_required,
        "Updated configuration overrides"
    );
    Ok(())
}
