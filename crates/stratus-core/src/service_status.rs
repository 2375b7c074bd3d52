// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Guest-reported datastore service status.
//!
//! The guest agent reports these through the record store. The task manager
//! only reads them, except for a few transitions it forces: `Paused` after a
//! reboot, `Failed` when a volume resize cannot be recovered, and
//! `FailedTimeoutGuestagent` when creation gives up waiting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of the datastore service running inside an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Service is up and accepting connections.
    Running,
    /// Service is blocked.
    Blocked,
    /// Status forced by the task manager until the guest reports again.
    Paused,
    /// Service is stopped.
    Shutdown,
    /// Service crashed.
    Crashed,
    /// Service failed to spawn.
    Failed,
    /// Guest is installing the datastore.
    Building,
    /// Guest reported nothing recognizable.
    Unknown,
    /// Record created, guest has not reported yet.
    New,
    /// Instance deleted.
    Deleted,
    /// Guest agent never became active during creation.
    FailedTimeoutGuestagent,
    /// Waiting for the guest to start building.
    BuildPending,
}

impl ServiceStatus {
    /// Internal name persisted in the record store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
            Self::Crashed => "crashed",
            Self::Failed => "failed",
            Self::Building => "building",
            Self::Unknown => "unknown",
            Self::New => "new",
            Self::Deleted => "deleted",
            Self::FailedTimeoutGuestagent => "failed_timeout_guestagent",
            Self::BuildPending => "build_pending",
        }
    }

    /// Status surfaced through the API.
    pub fn api_status(&self) -> &'static str {
        match self {
            Self::Running => "ACTIVE",
            Self::Blocked => "BLOCKED",
            Self::Paused | Self::Shutdown | Self::Crashed => "SHUTDOWN",
            Self::Failed => "FAILED",
            Self::Building | Self::BuildPending => "BUILD",
            Self::Unknown | Self::FailedTimeoutGuestagent => "ERROR",
            Self::New => "NEW",
            Self::Deleted => "DELETED",
        }
    }

    /// Human readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::Shutdown => "shutdown",
            Self::Crashed => "crashed",
            Self::Failed => "failed to spawn",
            Self::Building => "building",
            Self::Unknown => "unknown",
            Self::New => "new",
            Self::Deleted => "deleted",
            Self::FailedTimeoutGuestagent => "guestagent error",
            Self::BuildPending => "build pending",
        }
    }

    /// Whether the guest is still on its way to `Running` after a create.
    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::New | Self::Building)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown service status: {0}")]
pub struct UnknownServiceStatus(pub String);

impl FromStr for ServiceStatus {
    type Err = UnknownServiceStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "running" => Self::Running,
            "blocked" => Self::Blocked,
            "paused" => Self::Paused,
            "shutdown" => Self::Shutdown,
            "crashed" => Self::Crashed,
            "failed" => Self::Failed,
            "building" => Self::Building,
            "unknown" => Self::Unknown,
            "new" => Self::New,
            "deleted" => Self::Deleted,
            "failed_timeout_guestagent" => Self::FailedTimeoutGuestagent,
            "build_pending" => Self::BuildPending,
            other => return Err(UnknownServiceStatus(other.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_status() {
        assert_eq!(
            "failed_timeout_guestagent".parse::<ServiceStatus>().unwrap(),
            ServiceStatus::FailedTimeoutGuestagent
        );
        assert_eq!("shutdown".parse::<ServiceStatus>().unwrap(), ServiceStatus::Shutdown);
    }

    #[test]
    fn test_parse_unknown_status() {
        assert!("sleeping".parse::<ServiceStatus>().is_err());
    }

    #[test]
    fn test_provisioning_states() {
        assert!(ServiceStatus::New.is_provisioning());
        assert!(ServiceStatus::Building.is_provisioning());
        assert!(!ServiceStatus::Running.is_provisioning());
        assert!(!ServiceStatus::Failed.is_provisioning());
    }

    #[test]
    fn test_paused_reports_as_shutdown() {
        assert_eq!(ServiceStatus::Paused.api_status(), "SHUTDOWN");
        assert_eq!(ServiceStatus::FailedTimeoutGuestagent.api_status(), "ERROR");
    }
}
