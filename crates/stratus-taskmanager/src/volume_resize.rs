// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Growing an attached data volume.
//!
//! The work is an ordered list of steps, each paired with the recovery to
//! run if it fails. The driver runs the steps in order; on the first failure
//! it runs that step's recovery, logs any recovery error, and returns the
//! step's error.

use std::fmt;

use serde_json::{Map, json};
use stratus_core::{InstanceUpdate, ServiceStatus, TaskStatus};
use tracing::{debug, error, info, warn};

use crate::clients::{ServerStatus, VolumeStatus};
use crate::error::{Error, Result};
use crate::instance::BuiltInstance;
use crate::poll::poll_until;

/// One step of a volume resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStep {
    /// Stop the datastore.
    StopDb,
    /// Unmount the filesystem.
    UnmountVolume,
    /// Detach the volume and wait for `available`.
    DetachVolume,
    /// Ask the provider to grow the volume.
    ExtendVolume,
    /// Wait for the provider to report the new size.
    VerifyExtend,
    /// Reattach the volume and wait for `in-use`.
    AttachVolume,
    /// Grow the filesystem.
    ResizeFs,
    /// Mount the filesystem.
    MountVolume,
    /// Restart the datastore.
    RestartDb,
}

/// What to undo when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing to undo.
    None,
    /// Restart the datastore.
    Restart,
    /// Mount the filesystem, then restart the datastore.
    MountRestart,
    /// Reattach, mount, then restart.
    Full,
    /// Give up and mark the service `FAILED`.
    Fail,
}

impl fmt::Display for VolumeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Steps in execution order with their recoveries.
///
/// `VerifyExtend` picks `Fail` instead of `Full` when the provider is still
/// extending the volume at timeout.
pub const PIPELINE: [(VolumeStep, Recovery); 9] = [
    (VolumeStep::StopDb, Recovery::None),
    (VolumeStep::UnmountVolume, Recovery::Restart),
    (VolumeStep::DetachVolume, Recovery::MountRestart),
    (VolumeStep::ExtendVolume, Recovery::Full),
    (VolumeStep::VerifyExtend, Recovery::Full),
    (VolumeStep::AttachVolume, Recovery::Fail),
    (VolumeStep::ResizeFs, Recovery::Fail),
    (VolumeStep::MountVolume, Recovery::Fail),
    (VolumeStep::RestartDb, Recovery::None),
];

struct StepFailure {
    error: Error,
    recovery: Option<Recovery>,
}

impl From<Error> for StepFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            recovery: None,
        }
    }
}

/// Grow the data volume of a loaded instance to `new_size` GB.
///
/// Fails with [`Error::InvalidServerState`] unless the server is `ACTIVE`.
/// The task status is reset to `NONE` whatever the outcome.
pub async fn execute(instance: &mut BuiltInstance, new_size: i64) -> Result<()> {
    if !instance.server_status_matches(&[ServerStatus::Active]).await? {
        let actual = instance.server.status.to_string();
        reset_task_status(instance).await;
        return Err(Error::InvalidServerState {
            instance_id: instance.id().to_string(),
            expected: ServerStatus::Active.to_string(),
            actual,
        });
    }

    let result = resize(instance, new_size).await;
    reset_task_status(instance).await;
    result
}

async fn reset_task_status(instance: &mut BuiltInstance) {
    if let Err(e) = instance.reset_task_status().await {
        error!(instance_id = %instance.id(), error = %e, "Failed to reset task status");
    }
}

async fn resize(instance: &mut BuiltInstance, new_size: i64) -> Result<()> {
    let volume_id = instance.record.volume_id.clone().ok_or_else(|| {
        Error::Orchestration(format!("Instance {} has no volume", instance.id()))
    })?;
    let old_size = instance
        .ctx
        .clients
        .volume
        .get_volume(&volume_id)
        .await?
        .size;
    info!(
        instance_id = %instance.id(),
        volume_id = %volume_id,
        old_size,
        new_size,
        "Resizing volume"
    );

    let mut run = VolumeResize {
        instance,
        volume_id,
        new_size,
    };
    run.run_pipeline().await?;

    let instance = run.instance;
    instance
        .update(InstanceUpdate::task_status(TaskStatus::None))
        .await?;
    let volume_size = instance
        .ctx
        .clients
        .volume
        .get_volume(&run.volume_id)
        .await?
        .size;
    let flavor = instance
        .ctx
        .clients
        .compute
        .get_flavor(&instance.record.flavor_id)
        .await?;

    let mut extra = Map::new();
    extra.insert("old_volume_size".to_string(), json!(old_size));
    extra.insert("volume_size".to_string(), json!(volume_size));
    extra.insert("modify_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
    instance
        .send_usage_event("modify_volume", &flavor, None, extra)
        .await?;
    info!(instance_id = %instance.id(), volume_size, "Volume resized");
    Ok(())
}

struct VolumeResize<'a> {
    instance: &'a mut BuiltInstance,
    volume_id: String,
    new_size: i64,
}

impl VolumeResize<'_> {
    async fn run_pipeline(&mut self) -> Result<()> {
        for (step, recovery) in PIPELINE {
            debug!(instance_id = %self.instance.id(), step = %step, "Volume resize step");
            let outcome = match step {
                VolumeStep::VerifyExtend => self.verify_extend().await,
                other => self.run_step(other).await.map_err(StepFailure::from),
            };
            if let Err(failure) = outcome {
                let recovery = failure.recovery.unwrap_or(recovery);
                error!(
                    instance_id = %self.instance.id(),
                    step = %step,
                    recovery = %recovery,
                    error = %failure.error,
                    "Volume resize step failed"
                );
                if let Err(e) = self.recover(recovery).await {
                    error!(
                        instance_id = %self.instance.id(),
                        recovery = %recovery,
                        error = %e,
                        "Volume resize recovery failed"
                    );
                }
                return Err(failure.error);
            }
        }
        Ok(())
    }

    async fn run_step(&mut self, step: VolumeStep) -> Result<()> {
        let guest = self.instance.guest();
        let device_path = self.instance.device_path();
        let mount_point = self.instance.mount_point();
        match step {
            VolumeStep::StopDb => guest.stop_db(true).await?,
            VolumeStep::UnmountVolume => guest.unmount_volume(&device_path, &mount_point).await?,
            VolumeStep::DetachVolume => self.detach().await?,
            VolumeStep::ExtendVolume => {
                self.instance
                    .ctx
                    .clients
                    .volume
                    .extend_volume(&self.volume_id, self.new_size)
                    .await?
            }
            VolumeStep::AttachVolume => self.attach().await?,
            VolumeStep::ResizeFs => guest.resize_fs(&device_path, &mount_point).await?,
            VolumeStep::MountVolume => guest.mount_volume(&device_path, &mount_point).await?,
            VolumeStep::RestartDb => guest.restart().await?,
            VolumeStep::VerifyExtend => {
                return self.verify_extend().await.map_err(|f| f.error);
            }
        }
        Ok(())
    }

    async fn wait_for_volume(&self, expected: VolumeStatus) -> Result<()> {
        let client = &self.instance.ctx.clients.volume;
        let volume_id = self.volume_id.as_str();
        let expected = &expected;
        poll_until(
            move || async move { Ok::<_, Error>(client.get_volume(volume_id).await?) },
            |v| Ok(&v.status == expected),
            self.instance.ctx.config.poll_interval,
            self.instance.ctx.config.volume_time_out,
        )
        .await?;
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        self.instance
            .ctx
            .clients
            .volume
            .detach_volume(&self.volume_id)
            .await?;
        self.wait_for_volume(VolumeStatus::Available).await
    }

    async fn attach(&self) -> Result<()> {
        self.instance
            .ctx
            .clients
            .volume
            .attach_volume(
                &self.volume_id,
                &self.instance.server.id,
                &self.instance.device_path(),
            )
            .await?;
        self.wait_for_volume(VolumeStatus::InUse).await
    }

    async fn verify_extend(&mut self) -> std::result::Result<(), StepFailure> {
        let client = self.instance.ctx.clients.volume.clone();
        let volume_id = self.volume_id.as_str();
        let new_size = self.new_size;
        let polled = poll_until(
            || {
                let client = client.clone();
                async move { Ok::<_, Error>(client.get_volume(volume_id).await?) }
            },
            |v| {
                if v.status == VolumeStatus::Error {
                    return Err(Error::Orchestration(format!(
                        "Volume {} went to error while extending",
                        v.id
                    )));
                }
                Ok(v.size == new_size)
            },
            self.instance.ctx.config.poll_interval,
            self.instance.ctx.config.volume_time_out,
        )
        .await;

        match polled {
            Ok(_) => {
                self.instance
                    .update(InstanceUpdate {
                        volume_size: Some(new_size),
                        ..Default::default()
                    })
                    .await?;
                Ok(())
            }
            Err(e) if e.is_poll_timeout() => {
                let volume = client.get_volume(volume_id).await.map_err(Error::from)?;
                if volume.status == VolumeStatus::Extending {
                    warn!(
                        instance_id = %self.instance.id(),
                        volume_id = %volume.id,
                        "Volume still extending at timeout"
                    );
                    return Err(StepFailure {
                        error: e,
                        recovery: Some(Recovery::Fail),
                    });
                }
                if volume.size != new_size {
                    warn!(
                        instance_id = %self.instance.id(),
                        volume_id = %volume.id,
                        observed = volume.size,
                        requested = new_size,
                        "Volume extended to an unexpected size"
                    );
                    self.instance
                        .update(InstanceUpdate {
                            volume_size: Some(volume.size),
                            ..Default::default()
                        })
                        .await?;
                }
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn recover(&mut self, recovery: Recovery) -> Result<()> {
        let guest = self.instance.guest();
        let device_path = self.instance.device_path();
        let mount_point = self.instance.mount_point();
        match recovery {
            Recovery::None => {}
            Recovery::Restart => guest.restart().await?,
            Recovery::MountRestart => {
                guest.mount_volume(&device_path, &mount_point).await?;
                guest.restart().await?;
            }
            Recovery::Full => {
                self.attach().await?;
                guest.mount_volume(&device_path, &mount_point).await?;
                guest.restart().await?;
            }
            Recovery::Fail => {
                self.instance
                    .set_service_status(ServiceStatus::Failed)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recovery_of(step: VolumeStep) -> Recovery {
        PIPELINE
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, r)| *r)
            .unwrap()
    }

    #[test]
    fn test_pipeline_order() {
        let steps: Vec<VolumeStep> = PIPELINE.iter().map(|(s, _)| *s).collect();
        assert_eq!(steps.first(), Some(&VolumeStep::StopDb));
        assert_eq!(steps.last(), Some(&VolumeStep::RestartDb));
        let extend = steps.iter().position(|s| *s == VolumeStep::ExtendVolume);
        let attach = steps.iter().position(|s| *s == VolumeStep::AttachVolume);
        assert!(extend < attach);
    }

    #[test]
    fn test_recoveries() {
        assert_eq!(recovery_of(VolumeStep::StopDb), Recovery::None);
        assert_eq!(recovery_of(VolumeStep::UnmountVolume), Recovery::Restart);
        assert_eq!(recovery_of(VolumeStep::DetachVolume), Recovery::MountRestart);
        assert_eq!(recovery_of(VolumeStep::ExtendVolume), Recovery::Full);
        assert_eq!(recovery_of(VolumeStep::AttachVolume), Recovery::Fail);
        assert_eq!(recovery_of(VolumeStep::ResizeFs), Recovery::Fail);
        assert_eq!(recovery_of(VolumeStep::MountVolume), Recovery::Fail);
        assert_eq!(recovery_of(VolumeStep::RestartDb), Recovery::None);
    }
}
