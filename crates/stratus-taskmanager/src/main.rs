// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratus Task Manager
//!
//! Reads newline-delimited JSON task messages from stdin and runs them.
//! Only the in-process simulated cloud is wired in, so the binary must be
//! started with `--simulated`.

use std::sync::Arc;

use stratus_core::{NewInstance, Persistence, SqlitePersistence, TaskStatus};
use stratus_taskmanager::config::Config;
use stratus_taskmanager::runtime::TaskManagerRuntime;
use stratus_taskmanager::{SimulatedCloud, SimulatedGuest, TaskMessage, TracingNotifier};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus_taskmanager=info,stratus_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    if !std::env::args().skip(1).any(|arg| arg == "--simulated") {
        anyhow::bail!("no cloud provider configured; run with --simulated");
    }

    let config = Config::from_env()?;
    info!(
        database_path = %config.database_path.display(),
        region = %config.region,
        strategy = ?config.provisioning_strategy(),
        "Starting Stratus Task Manager"
    );

    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::from_path(&config.database_path).await?);
    info!("Database ready");

    let guest = Arc::new(SimulatedGuest::new(persistence.clone()));
    let clients = Arc::new(SimulatedCloud::new()).into_clients(guest);

    let runtime = TaskManagerRuntime::builder()
        .config(config)
        .persistence(persistence.clone())
        .clients(clients)
        .notifier(Arc::new(TracingNotifier))
        .build()?
        .start()
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("End of input");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let message = match serde_json::from_str::<TaskMessage>(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        error!(error = %e, "Ignoring malformed task message");
                        continue;
                    }
                };
                let message = match seed_instance(persistence.as_ref(), message).await {
                    Ok(message) => message,
                    Err(e) => {
                        error!(error = %e, "Failed to create instance record");
                        continue;
                    }
                };
                runtime.submit(message).await?;
            }
        }
    }

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Stratus Task Manager shut down");

    Ok(())
}

/// Create the `BUILDING` record a create task expects, as the API layer would.
async fn seed_instance(
    persistence: &dyn Persistence,
    message: TaskMessage,
) -> anyhow::Result<TaskMessage> {
    let TaskMessage::CreateInstance(mut request) = message else {
        return Ok(message);
    };
    if request.instance_id.is_empty() {
        request.instance_id = uuid::Uuid::new_v4().to_string();
    }
    if persistence.get_instance(&request.instance_id).await?.is_none() {
        persistence
            .create_instance(&NewInstance {
                id: request.instance_id.clone(),
                name: request.name.clone(),
                tenant_id: request.tenant_id.clone(),
                hostname: request.hostname.clone(),
                flavor_id: request.flavor.id.clone(),
                datastore_manager: request.datastore_manager.to_string(),
                volume_size: request.volume_size,
                task_status: TaskStatus::Building,
            })
            .await?;
        info!(instance_id = %request.instance_id, "Created instance record");
    }
    Ok(TaskMessage::CreateInstance(request))
}
