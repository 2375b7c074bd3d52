// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::service_status::ServiceStatus;
use crate::tasks::TaskStatus;

use super::{
    BackupRecord, BackupState, InstanceRecord, InstanceUpdate, NewBackup, NewInstance,
    Persistence,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed record store.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The pool must already have the schema applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/stratus.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate(&pool).await?;
        info!(path = %path.display(), "SQLite record store ready");

        Ok(Self { pool })
    }

    /// Open a private in-memory database with the schema applied.
    ///
    /// A single connection is used so every query sees the same database.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        MIGRATOR
            .run(pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    name: String,
    tenant_id: String,
    hostname: Option<String>,
    compute_instance_id: Option<String>,
    volume_id: Option<String>,
    flavor_id: String,
    datastore_manager: String,
    volume_size: Option<i64>,
    task_status: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = CoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        let task_status =
            TaskStatus::from_code(row.task_status).ok_or_else(|| CoreError::CorruptRecord {
                table: "instances",
                details: format!("unknown task_status code {}", row.task_status),
            })?;

        Ok(InstanceRecord {
            id: row.id,
            name: row.name,
            tenant_id: row.tenant_id,
            hostname: row.hostname,
            compute_instance_id: row.compute_instance_id,
            volume_id: row.volume_id,
            flavor_id: row.flavor_id,
            datastore_manager: row.datastore_manager,
            volume_size: row.volume_size,
            task_status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BackupRow {
    id: String,
    instance_id: String,
    tenant_id: String,
    name: String,
    location: Option<String>,
    backup_type: Option<String>,
    checksum: Option<String>,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BackupRow> for BackupRecord {
    type Error = CoreError;

    fn try_from(row: BackupRow) -> Result<Self, Self::Error> {
        Ok(BackupRecord {
            state: row.state.parse()?,
            id: row.id,
            instance_id: row.instance_id,
            tenant_id: row.tenant_id,
            name: row.name,
            location: row.location,
            backup_type: row.backup_type,
            checksum: row.checksum,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_instance(&self, instance: &NewInstance) -> Result<InstanceRecord, CoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO instances (id, name, tenant_id, hostname, flavor_id, datastore_manager,
                                   volume_size, task_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(&instance.tenant_id)
        .bind(&instance.hostname)
        .bind(&instance.flavor_id)
        .bind(&instance.datastore_manager)
        .bind(instance.volume_size)
        .bind(instance.task_status.code())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if let Some(db_err) = e.as_database_error()
                && db_err.is_unique_violation()
            {
                return Err(CoreError::InstanceAlreadyExists {
                    instance_id: instance.id.clone(),
                });
            }
            return Err(e.into());
        }

        sqlx::query(
            r#"
            INSERT INTO service_statuses (instance_id, status, updated_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&instance.id)
        .bind(ServiceStatus::New.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(InstanceRecord {
            id: instance.id.clone(),
            name: instance.name.clone(),
            tenant_id: instance.tenant_id.clone(),
            hostname: instance.hostname.clone(),
            compute_instance_id: None,
            volume_id: None,
            flavor_id: instance.flavor_id.clone(),
            datastore_manager: instance.datastore_manager.clone(),
            volume_size: instance.volume_size,
            task_status: instance.task_status,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT id, name, tenant_id, hostname, compute_instance_id, volume_id, flavor_id,
                   datastore_manager, volume_size, task_status, created_at, updated_at, deleted_at
            FROM instances
            WHERE id = ?
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(InstanceRecord::try_from).transpose()
    }

    async fn update_instance(
        &self,
        instance_id: &str,
        update: &InstanceUpdate,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET compute_instance_id = COALESCE(?, compute_instance_id),
                volume_id = COALESCE(?, volume_id),
                flavor_id = COALESCE(?, flavor_id),
                volume_size = COALESCE(?, volume_size),
                task_status = COALESCE(?, task_status),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.compute_instance_id)
        .bind(&update.volume_id)
        .bind(&update.flavor_id)
        .bind(update.volume_size)
        .bind(update.task_status.map(|s| s.code()))
        .bind(Utc::now())
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }

        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<(), CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET deleted_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        }
        debug!(instance_id = %instance_id, deleted_at = %now, "Instance soft-deleted");

        Ok(())
    }

    async fn get_service_status(
        &self,
        instance_id: &str,
    ) -> Result<Option<ServiceStatus>, CoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM service_statuses WHERE instance_id = ?")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(status,)| {
            status.parse().map_err(|e| CoreError::CorruptRecord {
                table: "service_statuses",
                details: format!("{}", e),
            })
        })
        .transpose()
    }

    async fn set_service_status(
        &self,
        instance_id: &str,
        status: ServiceStatus,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO service_statuses (instance_id, status, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (instance_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_backup(&self, backup: &NewBackup) -> Result<BackupRecord, CoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO backups (id, instance_id, tenant_id, name, location, backup_type,
                                 checksum, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&backup.id)
        .bind(&backup.instance_id)
        .bind(&backup.tenant_id)
        .bind(&backup.name)
        .bind(&backup.location)
        .bind(&backup.backup_type)
        .bind(&backup.checksum)
        .bind(backup.state.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(BackupRecord {
            id: backup.id.clone(),
            instance_id: backup.instance_id.clone(),
            tenant_id: backup.tenant_id.clone(),
            name: backup.name.clone(),
            location: backup.location.clone(),
            backup_type: backup.backup_type.clone(),
            checksum: backup.checksum.clone(),
            state: backup.state,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupRecord>, CoreError> {
        let row = sqlx::query_as::<_, BackupRow>(
            r#"
            SELECT id, instance_id, tenant_id, name, location, backup_type, checksum,
                   state, created_at, updated_at
            FROM backups
            WHERE id = ?
            "#,
        )
        .bind(backup_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BackupRecord::try_from).transpose()
    }

    async fn update_backup_state(
        &self,
        backup_id: &str,
        state: BackupState,
    ) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE backups SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(Utc::now())
            .bind(backup_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::BackupNotFound {
                backup_id: backup_id.to_string(),
            });
        }

        Ok(())
    }

    async fn delete_backup(&self, backup_id: &str) -> Result<(), CoreError> {
        let result = sqlx::query("DELETE FROM backups WHERE id = ?")
            .bind(backup_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::BackupNotFound {
                backup_id: backup_id.to_string(),
            });
        }

        Ok(())
    }

    async fn record_root_enabled(&self, instance_id: &str, user: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO root_enabled_history (instance_id, user, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT (instance_id) DO UPDATE SET
                user = excluded.user,
                created_at = excluded.created_at
            "#,
        )
        .bind(instance_id)
        .bind(user)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn root_enabled(&self, instance_id: &str) -> Result<bool, CoreError> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM root_enabled_history WHERE instance_id = ?")
                .bind(instance_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.0 > 0)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
