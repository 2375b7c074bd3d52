// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reboot, restart, delete and configuration override tasks.

mod common;

use std::collections::BTreeMap;

use common::*;
use serde_json::json;
use stratus_core::{InstanceUpdate, ServiceStatus, TaskStatus};
use stratus_taskmanager::clients::ServerStatus;
use stratus_taskmanager::{DatastoreManager, GuestError, ProviderError, TaskMessage};

fn i1() -> String {
    "i1".to_string()
}

#[tokio::test]
async fn test_reboot_pauses_service_and_resets_status() {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::Rebooting)
        .await;

    ctx.manager
        .dispatch(TaskMessage::Reboot { instance_id: i1() })
        .await
        .unwrap();

    assert_eq!(ctx.guest.call_count("stop_db").await, 1);
    assert_eq!(ctx.cloud.call_count("reboot_server").await, 1);
    let server = ctx.cloud.server("server-i1").await.unwrap();
    assert_eq!(server.status, ServerStatus::Active);
    assert_eq!(ctx.service_status("i1").await, Some(ServiceStatus::Paused));
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

#[tokio::test]
async fn test_reboot_failure_is_logged_not_returned() {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::Rebooting)
        .await;
    ctx.cloud
        .fail("reboot_server", ProviderError::remote(500, "hypervisor gone"))
        .await;

    ctx.manager
        .dispatch(TaskMessage::Reboot { instance_id: i1() })
        .await
        .unwrap();

    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

fn stop_db_error() -> GuestError {
    GuestError::Remote {
        method: "stop_db",
        message: "mysqld not responding".to_string(),
    }
}

#[tokio::test]
async fn test_reboot_recovers_crashed_datastore() {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::Rebooting)
        .await;
    ctx.persistence
        .set_service_status("i1", ServiceStatus::Crashed)
        .await
        .unwrap();
    ctx.guest.fail("stop_db", stop_db_error()).await;

    ctx.manager
        .dispatch(TaskMessage::Reboot { instance_id: i1() })
        .await
        .unwrap();

    assert_eq!(ctx.cloud.call_count("reboot_server").await, 1);
    assert_eq!(ctx.service_status("i1").await, Some(ServiceStatus::Paused));
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

#[tokio::test]
async fn test_reboot_skipped_while_datastore_running() {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::Rebooting)
        .await;
    ctx.guest.fail("stop_db", stop_db_error()).await;

    ctx.manager
        .dispatch(TaskMessage::Reboot { instance_id: i1() })
        .await
        .unwrap();

    assert_eq!(ctx.guest.call_count("stop_db").await, 1);
    assert_eq!(ctx.cloud.call_count("reboot_server").await, 0);
    assert_eq!(ctx.service_status("i1").await, Some(ServiceStatus::Running));
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

#[tokio::test]
async fn test_restart_swallows_guest_errors() {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::Rebooting)
        .await;
    ctx.guest
        .fail(
            "restart",
            GuestError::Remote {
                method: "restart",
                message: "mysqld crashed".to_string(),
            },
        )
        .await;

    ctx.manager
        .dispatch(TaskMessage::Restart { instance_id: i1() })
        .await
        .unwrap();

    assert_eq!(ctx.guest.call_count("restart").await, 1);
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

#[tokio::test]
async fn test_delete_removes_server_and_soft_deletes_record() {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::Deleting)
        .await;

    ctx.manager
        .dispatch(TaskMessage::DeleteInstance { instance_id: i1() })
        .await
        .unwrap();

    assert!(ctx.cloud.server("server-i1").await.is_none());
    let record = ctx.record("i1").await;
    assert!(record.deleted_at.is_some());
    assert_eq!(record.task_status, TaskStatus::None);

    let events = ctx.notifier.events_of("delete").await;
    assert_eq!(events.len(), 1);
    assert!(events[0].field("deleted_at").is_some());
    assert_eq!(ctx.cloud.call_count("delete_instance_entry").await, 0);
}

#[tokio::test]
async fn test_delete_tolerates_missing_server() {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::Deleting)
        .await;
    ctx.persistence
        .update_instance(
            "i1",
            &InstanceUpdate {
                compute_instance_id: Some("server-gone".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    ctx.manager
        .dispatch(TaskMessage::DeleteInstance { instance_id: i1() })
        .await
        .unwrap();

    assert!(ctx.record("i1").await.deleted_at.is_some());
    assert_eq!(ctx.notifier.events_of("delete").await.len(), 1);
}

#[tokio::test]
async fn test_delete_removes_dns_entry_when_enabled() {
    let config = stratus_taskmanager::Config {
        dns_support: true,
        ..fast_config()
    };
    let ctx = TestContext::with_config(config).await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::Deleting)
        .await;
    ctx.cloud
        .fail("delete_instance_entry", ProviderError::remote(503, "dns down"))
        .await;

    ctx.manager
        .dispatch(TaskMessage::DeleteInstance { instance_id: i1() })
        .await
        .unwrap();

    assert_eq!(ctx.cloud.call_count("delete_instance_entry").await, 1);
    assert!(ctx.record("i1").await.deleted_at.is_some());
}

#[tokio::test]
async fn test_dynamic_override_is_applied_live() {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::None)
        .await;

    ctx.manager
        .dispatch(TaskMessage::UpdateOverrides {
            instance_id: "i1".to_string(),
            overrides: BTreeMap::from([("max_connections".to_string(), json!(500))]),
            remove: false,
        })
        .await
        .unwrap();

    assert_eq!(ctx.guest.call_count("update_overrides").await, 1);
    assert_eq!(ctx.guest.call_count("apply_overrides").await, 1);
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

#[tokio::test]
async fn test_static_override_requires_restart() {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::None)
        .await;

    ctx.manager
        .dispatch(TaskMessage::UpdateOverrides {
            instance_id: "i1".to_string(),
            overrides: BTreeMap::from([("innodb_log_file_size".to_string(), json!("256M"))]),
            remove: false,
        })
        .await
        .unwrap();

    assert_eq!(ctx.task_status("i1").await, TaskStatus::RestartRequired);
}

#[tokio::test]
async fn test_removing_overrides_skips_apply() {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, TaskStatus::None)
        .await;

    ctx.manager
        .dispatch(TaskMessage::UpdateOverrides {
            instance_id: "i1".to_string(),
            overrides: BTreeMap::from([("wait_timeout".to_string(), json!(60))]),
            remove: true,
        })
        .await
        .unwrap();

    assert_eq!(ctx.guest.call_count("update_overrides").await, 1);
    assert_eq!(ctx.guest.call_count("apply_overrides").await, 0);
}
