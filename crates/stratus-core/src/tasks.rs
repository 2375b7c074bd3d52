// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance task statuses.
//!
//! The task status is the single persisted field describing what the task
//! manager is currently doing to an instance. `None` is both the initial and
//! the success-terminal state. Error variants are terminal for the operation
//! that set them; nothing makes further progress on an instance carrying one
//! until it is explicitly reset.
//!
//! ```text
//!   None ──create──▶ Building ──ok──▶ None
//!                       │
//!                       └─fail─▶ BuildingError{Dns,Server,Volume,SecGroup,TimeoutGa}
//!
//!   None ──resize──▶ Resizing ──(ok | fail)──▶ None
//!   None ──migrate─▶ Migrating ─(ok | fail)──▶ None
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task currently being performed on an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// No tasks for the instance.
    #[default]
    None,
    /// Deleting the instance.
    Deleting,
    /// Rebooting the instance.
    Rebooting,
    /// Resizing the instance (flavor or volume).
    Resizing,
    /// The instance is building.
    Building,
    /// Migrating the instance.
    Migrating,
    /// Instance requires a restart to apply configuration.
    RestartRequired,
    /// Promoting the instance to replica source.
    Promoting,
    /// Ejecting the replica source.
    Ejecting,
    /// Build error: DNS.
    BuildingErrorDns,
    /// Build error: Server.
    BuildingErrorServer,
    /// Build error: Volume.
    BuildingErrorVolume,
    /// Build error: security group or rule.
    BuildingErrorSecGroup,
    /// Build error: guest agent did not become active in time.
    BuildingErrorTimeoutGa,
    /// Build error: Replica.
    BuildingErrorReplica,
    /// Replica promotion error.
    PromotionError,
    /// Replica source ejection error.
    EjectionError,
}

impl TaskStatus {
    /// Every task status, in code order.
    pub const ALL: [TaskStatus; 17] = [
        Self::None,
        Self::Deleting,
        Self::Rebooting,
        Self::Resizing,
        Self::Building,
        Self::Migrating,
        Self::RestartRequired,
        Self::Promoting,
        Self::Ejecting,
        Self::BuildingErrorDns,
        Self::BuildingErrorServer,
        Self::BuildingErrorVolume,
        Self::BuildingErrorSecGroup,
        Self::BuildingErrorTimeoutGa,
        Self::PromotionError,
        Self::EjectionError,
        Self::BuildingErrorReplica,
    ];

    /// Numeric code persisted in the record store.
    pub fn code(&self) -> i64 {
        match self {
            Self::None => 0x01,
            Self::Deleting => 0x02,
            Self::Rebooting => 0x03,
            Self::Resizing => 0x04,
            Self::Building => 0x05,
            Self::Migrating => 0x06,
            Self::RestartRequired => 0x07,
            Self::Promoting => 0x08,
            Self::Ejecting => 0x09,
            Self::BuildingErrorDns => 0x50,
            Self::BuildingErrorServer => 0x51,
            Self::BuildingErrorVolume => 0x52,
            Self::BuildingErrorSecGroup => 0x53,
            Self::BuildingErrorTimeoutGa => 0x54,
            Self::PromotionError => 0x55,
            Self::EjectionError => 0x56,
            Self::BuildingErrorReplica => 0x57,
        }
    }

    /// Look up a task status by its persisted code.
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Action label shown to API users.
    pub fn action(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Deleting => "DELETING",
            Self::Rebooting => "REBOOTING",
            Self::Resizing => "RESIZING",
            Self::Building
            | Self::BuildingErrorDns
            | Self::BuildingErrorServer
            | Self::BuildingErrorVolume
            | Self::BuildingErrorSecGroup
            | Self::BuildingErrorReplica => "BUILDING",
            Self::Migrating => "MIGRATING",
            Self::RestartRequired => "RESTART_REQUIRED",
            Self::Promoting | Self::PromotionError => "PROMOTING",
            Self::Ejecting | Self::EjectionError => "EJECTING",
            Self::BuildingErrorTimeoutGa => "ERROR",
        }
    }

    /// Human readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::None => "No tasks for the instance.",
            Self::Deleting => "Deleting the instance.",
            Self::Rebooting => "Rebooting the instance.",
            Self::Resizing => "Resizing the instance.",
            Self::Building => "The instance is building.",
            Self::Migrating => "Migrating the instance.",
            Self::RestartRequired => "Instance requires a restart.",
            Self::Promoting => "Promoting the instance to replica source.",
            Self::Ejecting => "Ejecting the replica source.",
            Self::BuildingErrorDns => "Build error: DNS.",
            Self::BuildingErrorServer => "Build error: Server.",
            Self::BuildingErrorVolume => "Build error: Volume.",
            Self::BuildingErrorSecGroup => "Build error: Secgroup or rule.",
            Self::BuildingErrorTimeoutGa => "Build error: guestagent timeout.",
            Self::BuildingErrorReplica => "Build error: Replica.",
            Self::PromotionError => "Replica Promotion Error.",
            Self::EjectionError => "Replica Source Ejection Error.",
        }
    }

    /// Whether this status flags a terminal error.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::BuildingErrorDns
                | Self::BuildingErrorServer
                | Self::BuildingErrorVolume
                | Self::BuildingErrorSecGroup
                | Self::BuildingErrorTimeoutGa
                | Self::BuildingErrorReplica
                | Self::PromotionError
                | Self::EjectionError
        )
    }

    /// Whether an orchestration run may leave the record in this status.
    ///
    /// Busy statuses (`Building`, `Resizing`, ...) are never terminal.
    /// `RestartRequired` is a standing flag rather than an in-flight task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::None | Self::RestartRequired) || self.is_error()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({} {} {})",
            self.code(),
            self.action(),
            self.description()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_codes_are_unique() {
        let codes: HashSet<i64> = TaskStatus::ALL.iter().map(|t| t.code()).collect();
        assert_eq!(codes.len(), TaskStatus::ALL.len());
    }

    #[test]
    fn test_from_code_round_trips() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(TaskStatus::from_code(0x99), None);
    }

    #[test]
    fn test_timeout_and_replica_are_distinct() {
        assert_eq!(TaskStatus::BuildingErrorTimeoutGa.code(), 0x54);
        assert_ne!(
            TaskStatus::BuildingErrorTimeoutGa.code(),
            TaskStatus::BuildingErrorReplica.code()
        );
    }

    #[test]
    fn test_busy_statuses_are_not_terminal() {
        assert!(!TaskStatus::Building.is_terminal());
        assert!(!TaskStatus::Resizing.is_terminal());
        assert!(!TaskStatus::Migrating.is_terminal());
        assert!(TaskStatus::None.is_terminal());
        assert!(TaskStatus::BuildingErrorDns.is_terminal());
    }

    #[test]
    fn test_error_flags() {
        assert!(!TaskStatus::None.is_error());
        assert!(TaskStatus::BuildingErrorSecGroup.is_error());
        assert_eq!(TaskStatus::BuildingErrorTimeoutGa.action(), "ERROR");
    }
}
