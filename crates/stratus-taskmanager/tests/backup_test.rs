// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup creation and the delete cascade.

mod common;

use std::collections::HashMap;

use common::*;
use stratus_core::{BackupState, NewBackup, TaskStatus};
use stratus_taskmanager::backup::{self, MANIFEST_HEADER};
use stratus_taskmanager::clients::BackupInfo;
use stratus_taskmanager::{DatastoreManager, Error, ProviderError, TaskMessage};

const CONTAINER: &str = "database_backups";
const SEGMENTS: &str = "database_backups_segments";

async fn seed_backup(ctx: &TestContext, backup_id: &str, filename: Option<&str>) {
    ctx.persistence
        .create_backup(&NewBackup {
            id: backup_id.to_string(),
            instance_id: "i1".to_string(),
            tenant_id: "tenant-1".to_string(),
            name: "nightly".to_string(),
            location: filename
                .map(|name| format!("http://swift.local/v1/AUTH_tenant-1/{}/{}", CONTAINER, name)),
            backup_type: Some("InnoBackupEx".to_string()),
            checksum: None,
            state: BackupState::Completed,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_twice_is_idempotent() {
    let ctx = TestContext::new().await;
    seed_backup(&ctx, "b1", Some("b1.xbstream.gz")).await;
    ctx.cloud
        .put_object(CONTAINER, "b1.xbstream.gz", HashMap::new())
        .await;
    let message = TaskMessage::DeleteBackup {
        backup_id: "b1".to_string(),
    };

    ctx.manager.dispatch(message.clone()).await.unwrap();
    assert!(!ctx.cloud.has_object(CONTAINER, "b1.xbstream.gz").await);
    assert!(ctx.persistence.get_backup("b1").await.unwrap().is_none());

    // Already deleted: not-found is the only possible outcome.
    let second = backup::delete_backup(ctx.manager.context(), "b1").await;
    assert!(matches!(second, Err(Error::BackupNotFound(_))));
    ctx.manager.dispatch(message).await.unwrap();
}

#[tokio::test]
async fn test_delete_removes_manifest_segments_first() {
    let ctx = TestContext::new().await;
    seed_backup(&ctx, "b1", Some("b1.xbstream.gz")).await;
    let headers = HashMap::from([(
        "X-Object-Manifest".to_string(),
        format!("{}/b1.xbstream.gz_", SEGMENTS),
    )]);
    ctx.cloud
        .put_object(CONTAINER, "b1.xbstream.gz", headers)
        .await;
    for segment in ["b1.xbstream.gz_00000000", "b1.xbstream.gz_00000001"] {
        ctx.cloud.put_object(SEGMENTS, segment, HashMap::new()).await;
    }
    ctx.cloud
        .put_object(SEGMENTS, "other.xbstream.gz_00000000", HashMap::new())
        .await;

    backup::delete_backup(ctx.manager.context(), "b1")
        .await
        .unwrap();

    assert!(!ctx.cloud.has_object(SEGMENTS, "b1.xbstream.gz_00000000").await);
    assert!(!ctx.cloud.has_object(SEGMENTS, "b1.xbstream.gz_00000001").await);
    assert!(!ctx.cloud.has_object(CONTAINER, "b1.xbstream.gz").await);
    assert!(ctx.cloud.has_object(SEGMENTS, "other.xbstream.gz_00000000").await);

    let deletes: Vec<String> = ctx
        .cloud
        .calls()
        .await
        .into_iter()
        .filter(|c| c.starts_with("delete_object:"))
        .collect();
    assert_eq!(deletes.len(), 3);
    assert_eq!(
        deletes.last().map(String::as_str),
        Some("delete_object:database_backups/b1.xbstream.gz")
    );
    assert_eq!(MANIFEST_HEADER, "x-object-manifest");
}

#[tokio::test]
async fn test_missing_object_still_deletes_record() {
    let ctx = TestContext::new().await;
    seed_backup(&ctx, "b1", Some("b1.xbstream.gz")).await;

    backup::delete_backup(ctx.manager.context(), "b1")
        .await
        .unwrap();

    assert!(ctx.persistence.get_backup("b1").await.unwrap().is_none());
    assert_eq!(ctx.cloud.call_count("delete_object").await, 0);
}

#[tokio::test]
async fn test_backup_without_location_deletes_record_only() {
    let ctx = TestContext::new().await;
    seed_backup(&ctx, "b1", None).await;

    backup::delete_backup(ctx.manager.context(), "b1")
        .await
        .unwrap();

    assert!(ctx.persistence.get_backup("b1").await.unwrap().is_none());
    assert_eq!(ctx.cloud.call_count("head_object").await, 0);
}

#[tokio::test]
async fn test_storage_failure_marks_delete_failed_and_keeps_record() {
    let ctx = TestContext::new().await;
    seed_backup(&ctx, "b1", Some("b1.xbstream.gz")).await;
    ctx.cloud
        .put_object(CONTAINER, "b1.xbstream.gz", HashMap::new())
        .await;
    ctx.cloud
        .fail("delete_object", ProviderError::remote(500, "internal error"))
        .await;

    let result = ctx
        .manager
        .dispatch(TaskMessage::DeleteBackup {
            backup_id: "b1".to_string(),
        })
        .await;

    match result {
        Err(Error::Orchestration(message)) => {
            assert_eq!(message, "Failed to delete swift object for backup b1");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    let record = ctx.persistence.get_backup("b1").await.unwrap().unwrap();
    assert_eq!(record.state, BackupState::DeleteFailed);

    // A retry succeeds once storage recovers.
    ctx.cloud.clear_failure("delete_object").await;
    backup::delete_backup(ctx.manager.context(), "b1")
        .await
        .unwrap();
    assert!(ctx.persistence.get_backup("b1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_backup_fills_strategy() {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::None)
        .await;

    ctx.manager
        .dispatch(TaskMessage::CreateBackup {
            instance_id: "i1".to_string(),
            backup_info: BackupInfo {
                id: "b2".to_string(),
                ..Default::default()
            },
        })
        .await
        .unwrap();

    assert_eq!(ctx.guest.call_count("create_backup").await, 1);
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}
