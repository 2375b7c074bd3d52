// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratus-core.
//!
//! Every variant carries a stable machine-readable code so the API layer can
//! surface record-store failures without parsing messages.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the record store.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Instance was not found in the database.
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: String,
    },

    /// Instance already exists (duplicate create).
    InstanceAlreadyExists {
        /// The instance ID that already exists.
        instance_id: String,
    },

    /// Backup was not found in the database.
    BackupNotFound {
        /// The backup ID that was not found.
        backup_id: String,
    },

    /// A persisted value could not be decoded.
    CorruptRecord {
        /// Table the row came from.
        table: &'static str,
        /// What was wrong with it.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::InstanceAlreadyExists { .. } => "INSTANCE_ALREADY_EXISTS",
            Self::BackupNotFound { .. } => "BACKUP_NOT_FOUND",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error means the requested row does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::InstanceNotFound { .. } | Self::BackupNotFound { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceNotFound { instance_id } => {
                write!(f, "Instance '{}' not found", instance_id)
            }
            Self::InstanceAlreadyExists { instance_id } => {
                write!(f, "Instance '{}' already exists", instance_id)
            }
            Self::BackupNotFound { backup_id } => {
                write!(f, "Backup '{}' not found", backup_id)
            }
            Self::CorruptRecord { table, details } => {
                write!(f, "Corrupt row in '{}': {}", table, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                CoreError::InstanceNotFound {
                    instance_id: "i1".to_string(),
                },
                "INSTANCE_NOT_FOUND",
            ),
            (
                CoreError::BackupNotFound {
                    backup_id: "b1".to_string(),
                },
                "BACKUP_NOT_FOUND",
            ),
            (
                CoreError::CorruptRecord {
                    table: "instances",
                    details: "task_status 999".to_string(),
                },
                "CORRUPT_RECORD",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "locked".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(error.error_code(), expected_code, "{}", error);
        }
    }

    #[test]
    fn test_not_found_classification() {
        assert!(
            CoreError::BackupNotFound {
                backup_id: "b1".to_string()
            }
            .is_not_found()
        );
        assert!(
            !CoreError::DatabaseError {
                operation: "q".to_string(),
                details: "d".to_string()
            }
            .is_not_found()
        );
    }

    #[test]
    fn test_display_includes_id() {
        let err = CoreError::InstanceNotFound {
            instance_id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "Instance 'abc' not found");
    }
}
