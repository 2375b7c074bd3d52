// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable task manager runtime.
//!
//! [`TaskManagerRuntime`] runs a [`TaskWorker`] on the current tokio runtime
//! and hands out a sender for submitting tasks.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stratus_core::SqlitePersistence;
//! use stratus_taskmanager::runtime::TaskManagerRuntime;
//!
//! let runtime = TaskManagerRuntime::builder()
//!     .config(config)
//!     .persistence(Arc::new(SqlitePersistence::from_path("stratus.db").await?))
//!     .clients(clients)
//!     .notifier(notifier)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! runtime.submit(message).await?;
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;

use anyhow::Result;
use stratus_core::Persistence;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::clients::Clients;
use crate::config::Config;
use crate::manager::{TaskManager, TaskMessage};
use crate::notifier::{TracingNotifier, UsageNotifier};
use crate::worker::TaskWorker;

/// Default capacity of the task queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Builder for a [`TaskManagerRuntime`].
pub struct TaskManagerRuntimeBuilder {
    config: Option<Config>,
    persistence: Option<Arc<dyn Persistence>>,
    clients: Option<Clients>,
    notifier: Option<Arc<dyn UsageNotifier>>,
    queue_capacity: usize,
}

impl Default for TaskManagerRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: None,
            persistence: None,
            clients: None,
            notifier: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl TaskManagerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the record store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the remote collaborators (required).
    pub fn clients(mut self, clients: Clients) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Set the usage event publisher.
    ///
    /// Default: [`TracingNotifier`]
    pub fn notifier(mut self, notifier: Arc<dyn UsageNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the capacity of the task queue.
    ///
    /// Default: 64
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<TaskManagerRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let clients = self
            .clients
            .ok_or_else(|| anyhow::anyhow!("clients is required"))?;
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than zero");
        }

        Ok(TaskManagerRuntimeConfig {
            config,
            persistence,
            clients,
            notifier: self
                .notifier
                .unwrap_or_else(|| Arc::new(TracingNotifier)),
            queue_capacity: self.queue_capacity,
        })
    }
}

/// Configuration for a [`TaskManagerRuntime`].
pub struct TaskManagerRuntimeConfig {
    config: Config,
    persistence: Arc<dyn Persistence>,
    clients: Clients,
    notifier: Arc<dyn UsageNotifier>,
    queue_capacity: usize,
}

impl TaskManagerRuntimeConfig {
    /// Start the runtime, spawning the task worker.
    pub async fn start(self) -> Result<TaskManagerRuntime> {
        self.persistence.health_check_db().await?;

        let manager = TaskManager::new(
            self.config,
            self.persistence,
            self.clients,
            self.notifier,
        );
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let worker = TaskWorker::new(manager.clone(), receiver);
        let worker_shutdown = worker.shutdown_handle();

        let worker_handle = tokio::spawn(async move {
            worker.run().await;
        });

        info!(
            queue_capacity = self.queue_capacity,
            "TaskManagerRuntime started"
        );

        Ok(TaskManagerRuntime {
            sender,
            worker_handle,
            worker_shutdown,
            manager,
        })
    }
}

/// A running task manager.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination; in-flight
/// tasks are allowed to finish.
pub struct TaskManagerRuntime {
    sender: mpsc::Sender<TaskMessage>,
    worker_handle: JoinHandle<()>,
    worker_shutdown: Arc<Notify>,
    manager: TaskManager,
}

impl TaskManagerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> TaskManagerRuntimeBuilder {
        TaskManagerRuntimeBuilder::new()
    }

    /// Queue a task for execution.
    pub async fn submit(&self, message: TaskMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|e| anyhow::anyhow!("task worker is not running: {}", e))
    }

    /// The task manager driven by this runtime.
    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    /// Check if the worker is still running.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("TaskManagerRuntime shutting down...");
        self.worker_shutdown.notify_one();
        drop(self.sender);

        match self.worker_handle.await {
            Ok(()) => {
                info!("TaskManagerRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Task worker panicked: {}", e);
                Err(anyhow::anyhow!("task worker panicked: {}", e))
            }
        }
    }
}
