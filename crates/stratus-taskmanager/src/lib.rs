// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Task Manager - database instance orchestration
//!
//! Drives long-running, multi-step operations on managed database instances
//! by coordinating a compute provider, a block-volume provider, DNS, an
//! object store, security groups, an orchestration engine and the guest
//! agent running inside each instance.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                       TaskManagerRuntime                             │
//! │   submit(TaskMessage) ──► mpsc ──► TaskWorker ──► TaskManager        │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                                        │ dispatch
//!        ┌──────────────┬──────────────┬──────────────┬──┴───────────┐
//!        ▼              ▼              ▼              ▼              ▼
//!   create.rs      resize.rs   volume_resize.rs   backup.rs    lifecycle.rs
//!        │              │              │              │              │
//!        └──────────────┴──────┬───────┴──────────────┴──────────────┘
//!                              ▼
//!      ┌────────────────────────────────────┐   ┌────────────────────────┐
//!      │  clients (Compute, Volume, DNS,    │   │ stratus-core           │
//!      │  ObjectStore, SecurityGroup,       │   │ Persistence (SQLite)   │
//!      │  Orchestration, Guest)             │   │                        │
//!      └────────────────────────────────────┘   └────────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Task | Module |
//! |------|--------|
//! | `create_instance` | [`create`] |
//! | `resize_flavor`, `migrate` | [`resize`] |
//! | `resize_volume` | [`volume_resize`] |
//! | `reboot`, `restart`, `delete_instance`, `update_overrides` | [`lifecycle`] |
//! | `create_backup`, `delete_backup` | [`backup`] |
//!
//! Every task leaves the instance's task status terminal: `NONE`,
//! `RESTART_REQUIRED` or a specific error code.

pub mod backup;
pub mod clients;
pub mod config;
pub mod create;
pub mod datastore;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod manager;
pub mod notifier;
pub mod poll;
pub mod resize;
pub mod runtime;
pub mod template;
pub mod volume_resize;
pub mod worker;

pub use clients::{Clients, SimulatedCloud, SimulatedGuest};
pub use config::Config;
pub use create::CreateInstanceRequest;
pub use datastore::DatastoreManager;
pub use error::{Error, GuestError, ProviderError, Result};
pub use instance::{BuiltInstance, TaskContext};
pub use manager::{TaskManager, TaskMessage};
pub use notifier::{RecordingNotifier, TracingNotifier, UsageEvent, UsageNotifier};
pub use runtime::TaskManagerRuntime;
