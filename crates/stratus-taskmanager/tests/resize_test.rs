// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flavor resize and migration, including the revert barrier.

mod common;

use common::*;
use serde_json::json;
use stratus_core::{ServiceStatus, TaskStatus};
use stratus_taskmanager::clients::{ResizeBehavior, ServerStatus};
use stratus_taskmanager::{DatastoreManager, Error, GuestError, ProviderError, TaskMessage};

fn resize_message() -> TaskMessage {
    TaskMessage::ResizeFlavor {
        instance_id: "i1".to_string(),
        old_flavor: flavor("2", 1024),
        new_flavor: flavor("3", 2048),
    }
}

async fn seeded(status: TaskStatus) -> TestContext {
    let ctx = TestContext::new().await;
    ctx.seed_active_instance("i1", DatastoreManager::Mysql, "2", 5, status)
        .await;
    ctx
}

#[tokio::test]
async fn test_resize_success_records_new_flavor() {
    let ctx = seeded(TaskStatus::Resizing).await;

    ctx.manager.dispatch(resize_message()).await.unwrap();

    let record = ctx.record("i1").await;
    assert_eq!(record.flavor_id, "3");
    assert_eq!(record.task_status, TaskStatus::None);
    assert_eq!(ctx.cloud.call_count("confirm_resize").await, 1);
    assert_eq!(ctx.cloud.call_count("revert_resize").await, 0);
    assert_eq!(ctx.guest.call_count("stop_db").await, 1);
    assert_eq!(ctx.guest.call_count("start_db_with_conf_changes").await, 1);

    let events = ctx.notifier.events_of("modify_flavor").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].field("old_instance_size"), Some(&json!(1024)));
    assert_eq!(events[0].field("instance_size"), Some(&json!(2048)));
    assert_eq!(events[0].field("instance_type_id"), Some(&json!("3")));
}

#[tokio::test]
async fn test_failure_before_barrier_does_not_revert() {
    let ctx = seeded(TaskStatus::Resizing).await;
    ctx.cloud.set_resize_behavior(ResizeBehavior::Errors).await;

    let result = ctx.manager.dispatch(resize_message()).await;

    assert!(matches!(result, Err(Error::InvalidServerState { .. })));
    assert_eq!(ctx.cloud.call_count("revert_resize").await, 0);
    assert_eq!(ctx.cloud.call_count("confirm_resize").await, 0);
    // Server is in ERROR, so the guest is left alone.
    assert_eq!(ctx.guest.call_count("restart").await, 0);
    let record = ctx.record("i1").await;
    assert_eq!(record.task_status, TaskStatus::None);
    assert_eq!(record.flavor_id, "2");
}

#[tokio::test]
async fn test_initiate_failure_restarts_guest_without_revert() {
    let ctx = seeded(TaskStatus::Resizing).await;
    ctx.cloud
        .fail("resize_server", ProviderError::remote(409, "conflict"))
        .await;

    let result = ctx.manager.dispatch(resize_message()).await;

    assert!(matches!(result, Err(Error::Provider(_))));
    assert_eq!(ctx.cloud.call_count("revert_resize").await, 0);
    assert_eq!(ctx.guest.call_count("restart").await, 1);
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

#[tokio::test]
async fn test_flavor_assertion_failure_reverts_once() {
    let ctx = seeded(TaskStatus::Resizing).await;
    ctx.cloud
        .set_resize_behavior(ResizeBehavior::KeepsOldFlavor)
        .await;

    let result = ctx.manager.dispatch(resize_message()).await;

    match result {
        Err(Error::Orchestration(message)) => {
            assert_eq!(message, "Assertion failed! flavor_id=2 and not 3");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(ctx.cloud.call_count("revert_resize").await, 1);
    assert_eq!(ctx.guest.call_count("reset_configuration").await, 1);
    assert_eq!(ctx.guest.call_count("restart").await, 1);
    assert_eq!(ctx.cloud.call_count("confirm_resize").await, 0);

    let server = ctx.cloud.server("server-i1").await.unwrap();
    assert_eq!(server.status, ServerStatus::Active);
    assert_eq!(server.flavor_id, "2");
    let record = ctx.record("i1").await;
    assert_eq!(record.task_status, TaskStatus::None);
    assert_eq!(record.flavor_id, "2");
    assert!(ctx.notifier.events_of("modify_flavor").await.is_empty());
}

#[tokio::test]
async fn test_datastore_start_failure_reverts_resize() {
    let ctx = seeded(TaskStatus::Resizing).await;
    ctx.guest
        .fail(
            "start_db_with_conf_changes",
            GuestError::Remote {
                method: "start_db_with_conf_changes",
                message: "mysqld did not start".to_string(),
            },
        )
        .await;

    let result = ctx.manager.dispatch(resize_message()).await;

    assert!(matches!(result, Err(Error::Guest(_))));
    assert_eq!(ctx.cloud.call_count("revert_resize").await, 1);
    let server = ctx.cloud.server("server-i1").await.unwrap();
    assert_eq!(server.flavor_id, "2");
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

fn guest_error(method: &'static str) -> GuestError {
    GuestError::Remote {
        method,
        message: "guest agent broken".to_string(),
    }
}

#[tokio::test]
async fn test_revert_survives_reset_configuration_failure() {
    let ctx = seeded(TaskStatus::Resizing).await;
    ctx.guest
        .fail(
            "start_db_with_conf_changes",
            guest_error("start_db_with_conf_changes"),
        )
        .await;
    ctx.guest
        .fail("reset_configuration", guest_error("reset_configuration"))
        .await;

    let result = ctx.manager.dispatch(resize_message()).await;

    assert!(matches!(result, Err(Error::Guest(_))));
    assert_eq!(ctx.guest.call_count("reset_configuration").await, 1);
    assert_eq!(ctx.cloud.call_count("revert_resize").await, 1);
    let server = ctx.cloud.server("server-i1").await.unwrap();
    assert_eq!(server.status, ServerStatus::Active);
    assert_eq!(server.flavor_id, "2");
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

#[tokio::test]
async fn test_silent_guest_after_resize_is_not_taken_as_running() {
    let ctx = seeded(TaskStatus::Resizing).await;
    ctx.guest.mute("start_db_with_conf_changes").await;
    ctx.guest.mute("restart").await;

    let result = ctx.manager.dispatch(resize_message()).await;

    assert!(matches!(result, Err(Error::PollTimeout(_))));
    assert_eq!(ctx.guest.call_count("start_db_with_conf_changes").await, 1);
    assert_eq!(ctx.cloud.call_count("revert_resize").await, 1);
    assert_eq!(ctx.cloud.call_count("confirm_resize").await, 0);
    assert_eq!(ctx.service_status("i1").await, Some(ServiceStatus::Paused));
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

#[tokio::test]
async fn test_revert_survives_reset_configuration_timeout() {
    let ctx = seeded(TaskStatus::Resizing).await;
    ctx.cloud
        .set_resize_behavior(ResizeBehavior::KeepsOldFlavor)
        .await;
    ctx.guest.hang("reset_configuration").await;

    let result = ctx.manager.dispatch(resize_message()).await;

    assert!(matches!(result, Err(Error::Orchestration(_))));
    assert_eq!(ctx.cloud.call_count("revert_resize").await, 1);
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

#[tokio::test]
async fn test_stop_db_failure_leaves_provider_alone() {
    let ctx = seeded(TaskStatus::Resizing).await;
    ctx.guest
        .fail(
            "stop_db",
            GuestError::Remote {
                method: "stop_db",
                message: "busy".to_string(),
            },
        )
        .await;

    let result = ctx.manager.dispatch(resize_message()).await;

    assert!(matches!(result, Err(Error::Guest(_))));
    assert_eq!(ctx.cloud.call_count("resize_server").await, 0);
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}

#[tokio::test]
async fn test_migrate_moves_host_and_emits_event() {
    let ctx = seeded(TaskStatus::Migrating).await;

    ctx.manager
        .dispatch(TaskMessage::Migrate {
            instance_id: "i1".to_string(),
            host: Some("compute-9".to_string()),
        })
        .await
        .unwrap();

    let server = ctx.cloud.server("server-i1").await.unwrap();
    assert_eq!(server.host.as_deref(), Some("compute-9"));
    assert_eq!(server.status, ServerStatus::Active);
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
    assert_eq!(ctx.guest.call_count("restart").await, 1);
    assert_eq!(ctx.cloud.call_count("confirm_resize").await, 1);

    let events = ctx.notifier.events_of("migrate").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].field("host"), Some(&json!("compute-9")));
    assert_eq!(events[0].field("instance_size"), Some(&json!(1024)));
}

#[tokio::test]
async fn test_migrate_error_never_leaves_migrating() {
    let ctx = seeded(TaskStatus::Migrating).await;
    ctx.cloud.set_resize_behavior(ResizeBehavior::Errors).await;

    let result = ctx
        .manager
        .dispatch(TaskMessage::Migrate {
            instance_id: "i1".to_string(),
            host: None,
        })
        .await;

    assert!(result.is_err());
    assert_eq!(ctx.cloud.call_count("revert_resize").await, 0);
    assert_eq!(ctx.task_status("i1").await, TaskStatus::None);
}
