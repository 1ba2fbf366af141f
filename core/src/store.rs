// Append-only persistence of security events and alerts
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::error;
use uuid::Uuid;

use crate::error::StorageError;
use crate::event::{SecurityAlert, SecurityEvent};

/// Backing store for the event log. Events can only be appended and read;
/// alerts can additionally be marked resolved.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), StorageError>;

    /// Events with `from <= timestamp < to`, oldest first.
    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>, StorageError>;

    async fn append_alert(&self, alert: &SecurityAlert) -> Result<(), StorageError>;

    /// Newest first.
    async fn alerts(&self, unresolved_only: bool) -> Result<Vec<SecurityAlert>, StorageError>;

    async fn resolve_alert(
        &self,
        id: Uuid,
        resolved_at: DateTime<Utc>,
    ) -> Result<SecurityAlert, StorageError>;
}

#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<SecurityEvent>>,
    alerts: RwLock<Vec<SecurityAlert>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), StorageError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>, StorageError> {
        let events = self.events.read().await;
        let mut found: Vec<SecurityEvent> = events
            .iter()
            .filter(|e| e.timestamp >= from && e.timestamp < to)
            .cloned()
            .collect();
        // Stable: equal timestamps keep append order
        found.sort_by_key(|e| e.timestamp);
        Ok(found)
    }

    async fn append_alert(&self, alert: &SecurityAlert) -> Result<(), StorageError> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }

    async fn alerts(&self, unresolved_only: bool) -> Result<Vec<SecurityAlert>, StorageError> {
        let alerts = self.alerts.read().await;
        Ok(alerts
            .iter()
            .rev()
            .filter(|a| !unresolved_only || !a.resolved)
            .cloned()
            .collect())
    }

    async fn resolve_alert(
        &self,
        id: Uuid,
        resolved_at: DateTime<Utc>,
    ) -> Result<SecurityAlert, StorageError> {
        let mut alerts = self.alerts.write().await;
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        if !alert.resolved {
            alert.resolved = true;
            alert.resolved_at = Some(resolved_at);
        }
        Ok(alert.clone())
    }
}

/// Failure-isolating front for an `EventStore`. Writes never fail the caller:
/// errors are logged and reported as `false`.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn append(&self, event: &SecurityEvent) -> bool {
        match self.store.append_event(event).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Failed to persist security event: {}", e
                );
                false
            }
        }
    }

    pub async fn record_alert(&self, alert: &SecurityAlert) -> bool {
        match self.store.append_alert(alert).await {
            Ok(()) => true,
            Err(e) => {
                error!(alert_id = %alert.id, "Failed to persist security alert: {}", e);
                false
            }
        }
    }

    pub async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>, StorageError> {
        self.store.events_between(from, to).await
    }

    pub async fn alerts(&self, unresolved_only: bool) -> Result<Vec<SecurityAlert>, StorageError> {
        self.store.alerts(unresolved_only).await
    }

    pub async fn resolve_alert(
        &self,
        id: Uuid,
        resolved_at: DateTime<Utc>,
    ) -> Result<SecurityAlert, StorageError> {
        self.store.resolve_alert(id, resolved_at).await
    }
}
