// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup tasks.

use stratus_core::BackupState;
use tracing::{debug, error, info};

use crate::clients::BackupInfo;
use crate::error::{Error, ProviderError, Result};
use crate::instance::{BuiltInstance, TaskContext};

/// Header carrying the `container/prefix` of a segmented object's parts.
pub const MANIFEST_HEADER: &str = "x-object-manifest";

/// Split a manifest value `container/prefix` into its parts.
pub fn parse_manifest(manifest: &str) -> Option<(&str, &str)> {
    let (container, prefix) = manifest.split_once('/')?;
    if container.is_empty() || prefix.is_empty() {
        return None;
    }
    Some((container, prefix))
}

/// Ask the guest to produce a backup.
pub async fn create_backup(instance: &BuiltInstance, backup_info: &BackupInfo) -> Result<()> {
    info!(instance_id = %instance.id(), backup_id = %backup_info.id, "Creating backup");
    let mut info = backup_info.clone();
    if info.backup_type.is_none() {
        info.backup_type = instance
            .ctx
            .renderer
            .backup_strategy(instance.manager)
            .map(str::to_string);
    }
    instance.guest().create_backup(&info).await?;
    Ok(())
}

/// Delete a backup's stored objects, then its record.
///
/// A stored object that is already gone counts as deleted. Any other storage
/// failure marks the backup `DELETE_FAILED` and keeps the record so the
/// delete can be retried.
pub async fn delete_backup(ctx: &TaskContext, backup_id: &str) -> Result<()> {
    let backup = ctx
        .persistence
        .get_backup(backup_id)
        .await?
        .ok_or_else(|| Error::BackupNotFound(backup_id.to_string()))?;
    info!(backup_id = %backup.id, location = ?backup.location, "Deleting backup");

    if let Some(filename) = backup.filename() {
        let container = ctx.config.backup_swift_container.as_str();
        match delete_files(ctx, container, filename).await {
            Ok(()) => {}
            Err(ProviderError::NotFound { resource, id }) => {
                debug!(backup_id = %backup.id, resource, id = %id, "Backup object already gone");
            }
            Err(e) => {
                error!(backup_id = %backup.id, error = %e, "Failed to delete backup object");
                ctx.persistence
                    .update_backup_state(&backup.id, BackupState::DeleteFailed)
                    .await?;
                return Err(Error::Orchestration(format!(
                    "Failed to delete swift object for backup {}",
                    backup.id
                )));
            }
        }
    }

    ctx.persistence.delete_backup(&backup.id).await?;
    info!(backup_id = %backup.id, "Backup deleted");
    Ok(())
}

async fn delete_files(
    ctx: &TaskContext,
    container: &str,
    filename: &str,
) -> std::result::Result<(), ProviderError> {
    let store = &ctx.clients.object_store;
    let headers = store.head_object(container, filename).await?;
    let manifest = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(MANIFEST_HEADER))
        .map(|(_, v)| v.as_str());

    if let Some((segment_container, prefix)) = manifest.and_then(parse_manifest) {
        let segments = store.get_container(segment_container, prefix).await?;
        debug!(
            container = segment_container,
            prefix,
            count = segments.len(),
            "Deleting backup segments"
        );
        for segment in segments {
            store.delete_object(segment_container, &segment.name).await?;
        }
    }

    store.delete_object(container, filename).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        assert_eq!(
            parse_manifest("database_backups_segments/b1.xbstream.gz_"),
            Some(("database_backups_segments", "b1.xbstream.gz_"))
        );
        assert_eq!(parse_manifest("c/a/b"), Some(("c", "a/b")));
        assert_eq!(parse_manifest("nocontainer"), None);
        assert_eq!(parse_manifest("/prefix"), None);
        assert_eq!(parse_manifest("container/"), None);
    }
}
