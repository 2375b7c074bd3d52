// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratus-taskmanager.

use std::time::Duration;

use thiserror::Error;

use crate::poll::PollTimeoutError;

/// Failure reported by a remote provider (compute, volume, DNS, object store, ...).
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The resource does not exist (HTTP 404 equivalent).
    #[error("{resource} '{id}' not found")]
    NotFound {
        /// Kind of resource (server, volume, object, ...).
        resource: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The provider did not answer in time.
    #[error("{operation} timed out")]
    Timeout {
        /// Provider operation that timed out.
        operation: String,
    },

    /// The provider answered with an error.
    #[error("provider error {status}: {message}")]
    Remote {
        /// HTTP-style status code.
        status: u16,
        /// Error message returned by the provider.
        message: String,
    },
}

impl ProviderError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Shorthand for a `Remote` error.
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: message.into(),
        }
    }
}

/// Failure of a guest agent RPC.
#[derive(Debug, Clone, Error)]
pub enum GuestError {
    /// The guest did not answer within the call's timeout.
    #[error("guest call '{method}' timed out after {timeout:?}")]
    Timeout {
        /// RPC method name.
        method: &'static str,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The guest executed the call and reported a failure.
    #[error("guest call '{method}' failed: {message}")]
    Remote {
        /// RPC method name.
        method: &'static str,
        /// Failure reported by the guest.
        message: String,
    },
}

/// Task manager errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Record store operation failed.
    #[error("Core error: {0}")]
    Core(#[from] stratus_core::CoreError),

    /// Remote provider call failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Guest agent call failed.
    #[error("Guest error: {0}")]
    Guest(#[from] GuestError),

    /// A polling wait exceeded its timeout.
    #[error(transparent)]
    PollTimeout(#[from] PollTimeoutError),

    /// Fatal orchestration failure.
    #[error("{0}")]
    Orchestration(String),

    /// The compute server is not in the state the operation requires.
    #[error("Instance {instance_id} must be in state {expected}, not {actual}")]
    InvalidServerState {
        /// Instance being operated on.
        instance_id: String,
        /// Required server status.
        expected: String,
        /// Observed server status.
        actual: String,
    },

    /// A configured port or port range could not be turned into a rule.
    #[error("Error creating security group rules. Invalid port format. FromPort = {from}, ToPort = {to}")]
    MalformedSecurityGroupRule {
        /// Parsed lower bound, if any.
        from: String,
        /// Parsed upper bound, if any.
        to: String,
    },

    /// The provider reported the new volume in `error` status.
    #[error("Volume {0} failed to create")]
    VolumeCreationFailure(String),

    /// Instance was not found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Backup was not found.
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    /// Publishing a usage event failed.
    #[error("Notification error: {0}")]
    Notification(String),
}

impl Error {
    /// Whether this error is a polling timeout.
    pub fn is_poll_timeout(&self) -> bool {
        matches!(self, Self::PollTimeout(_))
    }
}

/// Result type using the task manager Error.
pub type Result<T> = std::result::Result<T, Error>;
