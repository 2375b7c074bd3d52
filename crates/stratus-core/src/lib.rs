// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Core - persisted data model for database instances
//!
//! This crate owns everything the task manager reads and writes between
//! orchestration steps: instance records, their task statuses, the
//! guest-reported service status, backups, and the root-enabled history.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │     stratus-taskmanager      │        │         guest agent          │
//! │  (create/resize/migrate/...) │        │  (reports service status)    │
//! └──────────────────────────────┘        └──────────────────────────────┘
//!                │                                       │
//!                ▼                                       ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                 stratus-core  Persistence trait                     │
//! └─────────────────────────────────────────────────────────────────────┘
//!                │
//!                ▼
//! ┌──────────────────────────────┐
//! │      SQLite (sqlx pool)      │
//! └──────────────────────────────┘
//! ```
//!
//! # Task statuses
//!
//! [`TaskStatus`] values are persisted as integer codes. `NONE` (0x01) is
//! both the initial and the success-terminal state; codes at 0x50 and above
//! are error markers.

pub mod error;
pub mod persistence;
pub mod service_status;
pub mod tasks;

pub use error::{CoreError, Result};
pub use persistence::{
    BackupRecord, BackupState, InstanceRecord, InstanceUpdate, NewBackup, NewInstance,
    Persistence, SqlitePersistence,
};
pub use service_status::{ServiceStatus, UnknownServiceStatus};
pub use tasks::TaskStatus;
