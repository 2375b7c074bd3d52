// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that consumes task messages.
//!
//! Each message is dispatched on its own task so a long resize does not hold
//! up a reboot of another instance. On shutdown the worker stops accepting
//! messages and waits for in-flight tasks to finish.

use std::sync::Arc;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::manager::{TaskManager, TaskMessage};

/// Consumes [`TaskMessage`]s from a channel and dispatches them.
pub struct TaskWorker {
    manager: TaskManager,
    receiver: mpsc::Receiver<TaskMessage>,
    shutdown: Arc<Notify>,
}

impl TaskWorker {
    /// Create a worker reading from `receiver`.
    pub fn new(manager: TaskManager, receiver: mpsc::Receiver<TaskMessage>) -> Self {
        Self {
            manager,
            receiver,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used to stop the worker.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shut down or until every sender is dropped.
    pub async fn run(mut self) {
        info!("Task worker started");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Task worker shutting down");
                    break;
                }

                message = self.receiver.recv() => {
                    let Some(message) = message else {
                        info!("Task channel closed, stopping worker");
                        break;
                    };
                    debug!(task = message.name(), "Received task");
                    let manager = self.manager.clone();
                    in_flight.spawn(async move {
                        // Errors are logged by dispatch.
                        let _ = manager.dispatch(message).await;
                    });
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Task panicked: {}", e);
                    }
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Task panicked: {}", e);
            }
        }
        info!("Task worker stopped");
    }
}
