// Security event pipeline: persist, count, alert
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::AlertDispatcher;
use crate::anomaly::{AnomalyDetector, AnomalyFinding, AssessmentData};
use crate::clock::Clock;
use crate::counter::ThresholdCounter;
use crate::error::StorageError;
use crate::event::{RequestContext, SecurityAlert, SecurityEvent, SecurityEventType, Severity};
use crate::store::EventLog;

/// Receives classified events, persists them and raises threshold alerts.
///
/// Nothing here fails the caller: storage and counter problems are logged
/// and the event is still returned.
pub struct SecurityMonitor {
    event_log: EventLog,
    counter: ThresholdCounter,
    dispatcher: AlertDispatcher,
    detector: AnomalyDetector,
    clock: Arc<dyn Clock>,
}

impl SecurityMonitor {
    pub fn new(
        event_log: EventLog,
        counter: ThresholdCounter,
        dispatcher: AlertDispatcher,
        detector: AnomalyDetector,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            event_log,
            counter,
            dispatcher,
            detector,
            clock,
        }
    }

    pub async fn log_security_event(
        &self,
        event_type: SecurityEventType,
        user_identifier: Option<&str>,
        details: Map<String, Value>,
        severity: Severity,
        context: &RequestContext,
    ) -> SecurityEvent {
        let event = SecurityEvent::new(
            self.clock.now(),
            event_type,
            user_identifier,
            details,
            severity,
            context,
        );

        match severity {
            Severity::Critical => warn!(
                "SECURITY EVENT [{}] {} from {} on {}",
                event.severity, event.event_type, event.ip_address, event.endpoint
            ),
            _ => info!(
                "Security event [{}] {} from {} on {}",
                event.severity, event.event_type, event.ip_address, event.endpoint
            ),
        }

        self.event_log.append(&event).await;
        self.check_threshold(&event).await;

        event
    }

    /// Every qualifying event at or past the threshold dispatches again;
    /// there is no de-duplication within a window.
    async fn check_threshold(&self, event: &SecurityEvent) -> Option<SecurityAlert> {
        let category = event.event_type.category()?;
        let count = self.counter.increment_and_get(category).await;
        let threshold = self.counter.thresholds().rule(category).count;

        // count == 0 means the counter failed open
        if count == 0 || count < threshold {
            debug!("{} at {}/{}", category, count, threshold);
            return None;
        }

        Some(self.dispatcher.dispatch(category, event, count).await)
    }

    /// Runs the anomaly checks and logs one `assessment_anomaly` event per
    /// finding. Returns the findings for the caller to act on.
    pub async fn screen_assessment(
        &self,
        user_id: &str,
        data: &AssessmentData,
        context: &RequestContext,
    ) -> Vec<AnomalyFinding> {
        let findings = self.detector.detect_assessment_anomalies(user_id, data);

        for finding in &findings {
            let details = match serde_json::to_value(finding) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };
            self.log_security_event(
                SecurityEventType::AssessmentAnomaly,
                Some(user_id),
                details,
                Severity::Warning,
                context,
            )
            .await;
        }

        findings
    }

    pub async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>, StorageError> {
        self.event_log.events_between(from, to).await
    }

    pub async fn alerts(&self, unresolved_only: bool) -> Result<Vec<SecurityAlert>, StorageError> {
        self.event_log.alerts(unresolved_only).await
    }

    pub async fn resolve_alert(&self, id: Uuid) -> Result<SecurityAlert, StorageError> {
        let alert = self.event_log.resolve_alert(id, self.clock.now()).await?;
        info!("Security alert {} resolved", id);
        Ok(alert)
    }
}
