// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flavor resize and host migration.
//!
//! Both actions share one control flow over compute-side states:
//!
//! ```text
//! Offline -> ActionInitiated -> PendingVerify -> RevertBarrierPassed
//!         -> ActionVerified -> ProcessesOk -> Confirmed
//! ```
//!
//! A failure before the barrier abandons the action. A failure at or after
//! it reverts the provider-side change first. Either way the guest is
//! restarted if the server is `ACTIVE`, the original error is returned, and
//! the task status is left at `NONE`.

use async_trait::async_trait;
use serde_json::{Map, json};
use stratus_core::{InstanceUpdate, ServiceStatus, TaskStatus};
use tracing::{debug, error, info, warn};

use crate::clients::{Flavor, ServerStatus};
use crate::error::{Error, Result};
use crate::instance::BuiltInstance;
use crate::poll::{poll_until, poll_until_true};

/// Progress of a resize or migrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionState {
    /// Datastore stopped, nothing asked of the provider yet.
    Offline,
    /// Provider action requested.
    ActionInitiated,
    /// Provider reports `VERIFY_RESIZE`.
    PendingVerify,
    /// Failures from here on revert the provider action.
    RevertBarrierPassed,
    /// Action-specific checks passed.
    ActionVerified,
    /// Datastore running again.
    ProcessesOk,
    /// Provider action committed.
    Confirmed,
    /// Rolling back after a failure.
    Reverting,
    /// Guest restarted after a failure.
    GuestRestarted,
}

impl ActionState {
    /// Whether a failure in this state must revert the provider action.
    pub fn needs_revert(&self) -> bool {
        matches!(
            self,
            Self::RevertBarrierPassed | Self::ActionVerified | Self::ProcessesOk
        )
    }
}

/// The parts of a resize or migrate that differ between the two.
#[async_trait]
pub trait ServerAction: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Ask the provider to start the action.
    async fn initiate(&self, instance: &BuiltInstance) -> Result<()>;

    /// Check the server after it reached `VERIFY_RESIZE`.
    async fn assert_action_succeeded(&self, _instance: &BuiltInstance) -> Result<()> {
        Ok(())
    }

    /// Start the datastore on the changed server.
    async fn start_datastore(&self, instance: &BuiltInstance) -> Result<()>;

    /// Roll the provider action back.
    async fn revert(&self, instance: &BuiltInstance) -> Result<()> {
        instance
            .ctx
            .clients
            .compute
            .revert_resize(&instance.server.id)
            .await?;
        Ok(())
    }

    /// Persist the outcome and publish the usage event.
    async fn record_success(&self, instance: &mut BuiltInstance) -> Result<()>;
}

/// Resize to another flavor.
pub struct ResizeFlavorAction {
    /// Flavor before the resize.
    pub old_flavor: Flavor,
    /// Requested flavor.
    pub new_flavor: Flavor,
}

#[async_trait]
impl ServerAction for ResizeFlavorAction {
    fn name(&self) -> &'static str {
        "resize"
    }

    async fn initiate(&self, instance: &BuiltInstance) -> Result<()> {
        instance
            .ctx
            .clients
            .compute
            .resize_server(&instance.server.id, &self.new_flavor.id)
            .await?;
        Ok(())
    }

    async fn assert_action_succeeded(&self, instance: &BuiltInstance) -> Result<()> {
        if instance.server.flavor_id != self.new_flavor.id {
            return Err(Error::Orchestration(format!(
                "Assertion failed! flavor_id={} and not {}",
                instance.server.flavor_id, self.new_flavor.id
            )));
        }
        Ok(())
    }

    async fn start_datastore(&self, instance: &BuiltInstance) -> Result<()> {
        let config = instance
            .ctx
            .renderer
            .render_config(instance.manager, &self.new_flavor);
        instance.guest().start_db_with_conf_changes(&config).await?;
        Ok(())
    }

    async fn revert(&self, instance: &BuiltInstance) -> Result<()> {
        let config = instance
            .ctx
            .renderer
            .render_config(instance.manager, &self.old_flavor);
        // The provider revert runs no matter what the guest answers.
        if let Err(e) = instance.guest().reset_configuration(&config).await {
            warn!(
                instance_id = %instance.id(),
                error = %e,
                "Failed to reset configuration, reverting anyway"
            );
        }
        instance
            .ctx
            .clients
            .compute
            .revert_resize(&instance.server.id)
            .await?;
        Ok(())
    }

    async fn record_success(&self, instance: &mut BuiltInstance) -> Result<()> {
        instance
            .update(InstanceUpdate {
                flavor_id: Some(self.new_flavor.id.clone()),
                task_status: Some(TaskStatus::None),
                ..Default::default()
            })
            .await?;

        let now = chrono::Utc::now().to_rfc3339();
        let mut extra = Map::new();
        extra.insert("old_instance_size".to_string(), json!(self.old_flavor.ram));
        extra.insert("launched_at".to_string(), json!(now));
        extra.insert("modify_at".to_string(), json!(now));
        instance
            .send_usage_event("modify_flavor", &self.new_flavor, Some(self.new_flavor.ram), extra)
            .await
    }
}

/// Move to another host.
pub struct MigrateAction {
    /// Target host, or `None` to let the provider choose.
    pub host: Option<String>,
    /// Current flavor, reported in the usage event.
    pub flavor: Flavor,
}

#[async_trait]
impl ServerAction for MigrateAction {
    fn name(&self) -> &'static str {
        "migrate"
    }

    async fn initiate(&self, instance: &BuiltInstance) -> Result<()> {
        instance
            .ctx
            .clients
            .compute
            .migrate_server(&instance.server.id, self.host.as_deref())
            .await?;
        Ok(())
    }

    async fn start_datastore(&self, instance: &BuiltInstance) -> Result<()> {
        instance.guest().restart().await?;
        Ok(())
    }

    async fn record_success(&self, instance: &mut BuiltInstance) -> Result<()> {
        instance
            .update(InstanceUpdate::task_status(TaskStatus::None))
            .await?;
        let mut extra = Map::new();
        extra.insert("host".to_string(), json!(instance.server.host));
        instance
            .send_usage_event("migrate", &self.flavor, None, extra)
            .await
    }
}

/// Run a resize or migrate on a loaded instance.
pub async fn execute(instance: &mut BuiltInstance, action: &dyn ServerAction) -> Result<()> {
    info!(instance_id = %instance.id(), action = action.name(), "Starting server action");
    let result = run(instance, action).await;

    let reset = match instance.refresh_record().await.map(|r| r.task_status) {
        Ok(TaskStatus::None) => Ok(()),
        Ok(_) => instance.reset_task_status().await,
        Err(e) => Err(e),
    };
    if let Err(e) = &reset {
        error!(instance_id = %instance.id(), error = %e, "Failed to reset task status");
    }

    match result {
        Ok(()) => {
            info!(instance_id = %instance.id(), action = action.name(), "Server action complete");
            reset
        }
        Err(e) => Err(e),
    }
}

async fn run(instance: &mut BuiltInstance, action: &dyn ServerAction) -> Result<()> {
    instance.guest().stop_db(true).await?;
    wait_for_service(instance, ServiceStatus::Shutdown).await?;

    let mut state = ActionState::Offline;
    if let Err(e) = perform(instance, action, &mut state).await {
        error!(
            instance_id = %instance.id(),
            action = action.name(),
            state = ?state,
            error = %e,
            "Server action failed"
        );
        recover(instance, action, state).await;
        return Err(e);
    }

    action.record_success(instance).await
}

async fn perform(
    instance: &mut BuiltInstance,
    action: &dyn ServerAction,
    state: &mut ActionState,
) -> Result<()> {
    action.initiate(instance).await?;
    *state = ActionState::ActionInitiated;

    let config = instance.ctx.config.clone();
    let compute = instance.ctx.clients.compute.clone();
    let server_id = instance.server.id.clone();
    let server = poll_until(
        || {
            let compute = compute.clone();
            let server_id = server_id.clone();
            async move { Ok::<_, Error>(compute.get_server(&server_id).await?) }
        },
        |server| Ok(server.status != ServerStatus::Resize),
        config.poll_interval,
        config.resize_time_out,
    )
    .await?;
    instance.server = server;

    if instance.server.status != ServerStatus::VerifyResize {
        return Err(Error::InvalidServerState {
            instance_id: instance.id().to_string(),
            expected: ServerStatus::VerifyResize.to_string(),
            actual: instance.server.status.to_string(),
        });
    }
    *state = ActionState::PendingVerify;

    *state = ActionState::RevertBarrierPassed;
    debug!(instance_id = %instance.id(), action = action.name(), "Passed revert barrier");

    action.assert_action_succeeded(instance).await?;
    *state = ActionState::ActionVerified;

    // Only a fresh guest report can move the service off PAUSED.
    instance.set_service_status(ServiceStatus::Paused).await?;
    action.start_datastore(instance).await?;
    wait_for_service(instance, ServiceStatus::Running).await?;
    *state = ActionState::ProcessesOk;

    compute.confirm_resize(&server_id).await?;
    *state = ActionState::Confirmed;
    Ok(())
}

async fn recover(instance: &mut BuiltInstance, action: &dyn ServerAction, state: ActionState) {
    if state.needs_revert() {
        info!(instance_id = %instance.id(), action = action.name(), "Reverting server action");
        if let Err(e) = revert(instance, action).await {
            error!(instance_id = %instance.id(), error = %e, "Revert failed");
        }
    }

    match instance.refresh_server().await.map(|s| s.status.clone()) {
        Ok(ServerStatus::Active) => {
            match instance.guest().restart().await {
                Ok(()) => debug!(
                    instance_id = %instance.id(),
                    state = ?ActionState::GuestRestarted,
                    "Restarted guest after failure"
                ),
                Err(e) => warn!(
                    instance_id = %instance.id(),
                    error = %e,
                    "Failed to restart guest after failure"
                ),
            }
        }
        Ok(status) => {
            warn!(
                instance_id = %instance.id(),
                status = %status,
                "Server is not active, leaving guest alone"
            );
        }
        Err(e) => {
            error!(instance_id = %instance.id(), error = %e, "Failed to fetch server");
        }
    }
}

async fn revert(instance: &mut BuiltInstance, action: &dyn ServerAction) -> Result<()> {
    debug!(instance_id = %instance.id(), state = ?ActionState::Reverting, "Reverting");
    action.revert(instance).await?;

    let config = instance.ctx.config.clone();
    let compute = instance.ctx.clients.compute.clone();
    let server_id = instance.server.id.clone();
    poll_until(
        || {
            let compute = compute.clone();
            let server_id = server_id.clone();
            async move { Ok::<_, Error>(compute.get_server(&server_id).await?) }
        },
        |server| Ok(server.status == ServerStatus::Active),
        config.poll_interval,
        config.revert_time_out,
    )
    .await?;
    Ok(())
}

/// Wait for the guest to report `expected`, bounded by the resize timeout.
async fn wait_for_service(instance: &BuiltInstance, expected: ServiceStatus) -> Result<()> {
    let persistence = &instance.ctx.persistence;
    let id = instance.id();
    poll_until_true(
        move || async move {
            Ok::<_, Error>(persistence.get_service_status(id).await? == Some(expected))
        },
        instance.ctx.config.poll_interval,
        instance.ctx.config.resize_time_out,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_barrier_position() {
        assert!(!ActionState::Offline.needs_revert());
        assert!(!ActionState::ActionInitiated.needs_revert());
        assert!(!ActionState::PendingVerify.needs_revert());
        assert!(ActionState::RevertBarrierPassed.needs_revert());
        assert!(ActionState::ActionVerified.needs_revert());
        assert!(ActionState::ProcessesOk.needs_revert());
        assert!(!ActionState::Confirmed.needs_revert());
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(ActionState::PendingVerify < ActionState::RevertBarrierPassed);
        assert!(ActionState::RevertBarrierPassed < ActionState::Confirmed);
    }
}
