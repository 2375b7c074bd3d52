// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Usage (billing) events.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::Result;

/// Prefix of every usage event type.
pub const EVENT_TYPE_PREFIX: &str = "stratus.instance";

/// A usage event, published after a successful create, flavor change,
/// volume change, migration or delete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageEvent {
    /// `stratus.instance.<kind>`, e.g. `stratus.instance.create`.
    pub event_type: String,
    /// Host that published the event.
    pub publisher_id: String,
    /// Event payload.
    pub payload: Map<String, Value>,
}

impl UsageEvent {
    /// Build an event of the given kind.
    pub fn new(kind: &str, publisher_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type: format!("{}.{}", EVENT_TYPE_PREFIX, kind),
            publisher_id: publisher_id.into(),
            payload,
        }
    }

    /// Payload field, if present.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Publishes usage events.
#[async_trait]
pub trait UsageNotifier: Send + Sync {
    /// Publish one event.
    async fn notify(&self, event: UsageEvent) -> Result<()>;
}

/// Writes usage events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl UsageNotifier for TracingNotifier {
    async fn notify(&self, event: UsageEvent) -> Result<()> {
        let payload = Value::Object(event.payload);
        info!(
            event_type = %event.event_type,
            publisher_id = %event.publisher_id,
            payload = %payload,
            "Usage event"
        );
        Ok(())
    }
}

/// Keeps usage events in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<UsageEvent>>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far.
    pub async fn events(&self) -> Vec<UsageEvent> {
        self.events.lock().await.clone()
    }

    /// Events of one kind (`create`, `delete`, ...).
    pub async fn events_of(&self, kind: &str) -> Vec<UsageEvent> {
        let event_type = format!("{}.{}", EVENT_TYPE_PREFIX, kind);
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl UsageNotifier for RecordingNotifier {
    async fn notify(&self, event: UsageEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_filters_by_kind() {
        let notifier = RecordingNotifier::new();
        notifier
            .notify(UsageEvent::new("create", "host-a", Map::new()))
            .await
            .unwrap();
        notifier
            .notify(UsageEvent::new("delete", "host-a", Map::new()))
            .await
            .unwrap();

        let created = notifier.events_of("create").await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].event_type, "stratus.instance.create");
        assert_eq!(created[0].publisher_id, "host-a");
        assert_eq!(notifier.events().await.len(), 2);
    }
}
