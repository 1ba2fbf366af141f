// Threshold-breach notifications
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::counter::Thresholds;
use crate::error::DispatchError;
use crate::event::{SecurityAlert, SecurityEvent, ThresholdCategory};
use crate::store::EventLog;

pub const THRESHOLD_ALERT_TYPE: &str = "threshold_exceeded";

/// Where alert messages go. Keeps detection independent of delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, recipient: &str, subject: &str, body: &str) -> Result<(), DispatchError>;
}

/// Writes alerts to the log instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, recipient: &str, subject: &str, body: &str) -> Result<(), DispatchError> {
        warn!(recipient, subject, "SECURITY ALERT\n{}", body);
        Ok(())
    }
}

#[cfg(feature = "smtp")]
pub use smtp::SmtpNotificationSink;

#[cfg(feature = "smtp")]
mod smtp {
    use async_trait::async_trait;
    use lettre::message::{header::ContentType, Mailbox};
    use lettre::transport::smtp::authentication::Credentials;
    use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
    use secrecy::ExposeSecret;
    use std::time::Duration;

    use super::NotificationSink;
    use crate::config::SmtpSettings;
    use crate::error::DispatchError;

    /// STARTTLS relay with credentials. One message per recipient.
    pub struct SmtpNotificationSink {
        from: Mailbox,
        transport: AsyncSmtpTransport<Tokio1Executor>,
    }

    impl SmtpNotificationSink {
        pub fn new(settings: &SmtpSettings, from: &str) -> Result<Self, DispatchError> {
            let from: Mailbox = from
                .parse()
                .map_err(|_| DispatchError::InvalidRecipient(from.to_string()))?;

            let credentials = Credentials::new(
                settings.username.clone(),
                settings.password.expose_secret().clone(),
            );
            let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| DispatchError::Transport(e.to_string()))?
                .port(settings.port)
                .credentials(credentials)
                .timeout(Some(Duration::from_secs(settings.timeout_secs)))
                .build();

            Ok(Self { from, transport })
        }
    }

    #[async_trait]
    impl NotificationSink for SmtpNotificationSink {
        fn name(&self) -> &str {
            "smtp"
        }

        async fn deliver(&self, recipient: &str, subject: &str, body: &str) -> Result<(), DispatchError> {
            let to: Mailbox = recipient
                .parse()
                .map_err(|_| DispatchError::InvalidRecipient(recipient.to_string()))?;

            let email = Message::builder()
                .from(self.from.clone())
                .to(to)
                .subject(subject)
                .header(ContentType::TEXT_PLAIN)
                .body(body.to_string())
                .map_err(|e| DispatchError::Message(e.to_string()))?;

            self.transport
                .send(email)
                .await
                .map_err(|e| DispatchError::Transport(e.to_string()))?;
            Ok(())
        }
    }
}

/// Sends a notification to every recipient and records a `SecurityAlert`
/// for each dispatch. Best effort: failed deliveries are logged, never
/// retried and never returned.
pub struct AlertDispatcher {
    app_name: String,
    recipients: Vec<String>,
    sink: Arc<dyn NotificationSink>,
    thresholds: Thresholds,
    event_log: EventLog,
    clock: Arc<dyn Clock>,
}

impl AlertDispatcher {
    pub fn new(
        app_name: impl Into<String>,
        recipients: Vec<String>,
        sink: Arc<dyn NotificationSink>,
        thresholds: Thresholds,
        event_log: EventLog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            recipients,
            sink,
            thresholds,
            event_log,
            clock,
        }
    }

    pub fn subject(&self, category: ThresholdCategory) -> String {
        format!("{} Security Alert - {}", self.app_name, category)
    }

    pub fn compose_body(
        &self,
        category: ThresholdCategory,
        latest_event: &SecurityEvent,
        count: u64,
    ) -> String {
        let rule = self.thresholds.rule(category);
        format!(
            "Security Alert: {category}\n\
             \n\
             Severity: {severity}\n\
             Threshold exceeded: {count} events in {window} seconds (threshold: {threshold})\n\
             \n\
             Latest Event Details:\n\
             - Event Type: {event_type}\n\
             - Time: {time}\n\
             - IP Address: {ip}\n\
             - User Agent: {user_agent}\n\
             - Endpoint: {method} {endpoint}\n\
             - User: {user}\n\
             \n\
             Please investigate this security incident immediately.\n\
             \n\
             This is an automated message from {app} security monitoring.\n",
            category = category,
            severity = rule.severity,
            count = count,
            window = rule.window_secs,
            threshold = rule.count,
            event_type = latest_event.event_type,
            time = latest_event.timestamp.to_rfc3339(),
            ip = latest_event.ip_address,
            user_agent = latest_event.user_agent,
            method = latest_event.method,
            endpoint = latest_event.endpoint,
            user = latest_event.user_identifier,
            app = self.app_name,
        )
    }

    pub async fn dispatch(
        &self,
        category: ThresholdCategory,
        latest_event: &SecurityEvent,
        count: u64,
    ) -> SecurityAlert {
        let rule = self.thresholds.rule(category);
        let subject = self.subject(category);
        let body = self.compose_body(category, latest_event, count);

        if self.recipients.is_empty() {
            warn!("No alert recipients configured; {} alert not sent", category);
        }

        let mut delivered = 0usize;
        for recipient in &self.recipients {
            match self.sink.deliver(recipient, &subject, &body).await {
                Ok(()) => delivered += 1,
                Err(e) => error!(
                    sink = self.sink.name(),
                    recipient = recipient.as_str(),
                    "Failed to deliver security alert: {}", e
                ),
            }
        }

        info!(
            "Security alert dispatched: {} ({} events, {}/{} recipients)",
            category,
            count,
            delivered,
            self.recipients.len()
        );

        let alert = SecurityAlert {
            id: Uuid::new_v4(),
            alert_type: THRESHOLD_ALERT_TYPE.to_string(),
            event_type: category,
            count,
            timeframe: rule.window_secs,
            alert_details: json!({
                "severity": rule.severity,
                "threshold": rule.count,
                "delivered": delivered,
                "latest_event": latest_event,
            }),
            created_at: self.clock.now(),
            resolved: false,
            resolved_at: None,
        };
        self.event_log.record_alert(&alert).await;

        alert
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event::{RequestContext, SecurityEventType, Severity};
    use crate::store::MemoryEventStore;
    use serde_json::Map;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct SentMessage {
        pub recipient: String,
        pub subject: String,
        pub body: String,
    }

    /// Captures messages; recipients listed in `reject` fail delivery.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub sent: Mutex<Vec<SentMessage>>,
        pub reject: Vec<String>,
    }

    impl RecordingSink {
        pub fn sent(&self) -> Vec<SentMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, recipient: &str, subject: &str, body: &str) -> Result<(), DispatchError> {
            if self.reject.iter().any(|r| r == recipient) {
                return Err(DispatchError::Transport("connection refused".to_string()));
            }
            self.sent.lock().unwrap().push(SentMessage {
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
            Ok(())
        }
    }

    fn latest_event(clock: &ManualClock) -> SecurityEvent {
        let ctx = RequestContext {
            ip_address: Some("203.0.113.9".to_string()),
            user_agent: Some("sqlmap/1.7".to_string()),
            endpoint: Some("/api/assessments".to_string()),
            method: Some("POST".to_string()),
        };
        SecurityEvent::new(
            clock.now(),
            SecurityEventType::SqlInjectionAttempt,
            Some("user-7"),
            Map::new(),
            Severity::Critical,
            &ctx,
        )
    }

    #[tokio::test]
    async fn test_dispatch_composes_and_records() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let sink = Arc::new(RecordingSink {
            reject: vec!["down@example.com".to_string()],
            ..Default::default()
        });
        let store = Arc::new(MemoryEventStore::new());
        let log = EventLog::new(store);
        let dispatcher = AlertDispatcher::new(
            "Guardrail",
            vec!["sec@example.com".to_string(), "down@example.com".to_string()],
            sink.clone(),
            Thresholds::default(),
            log.clone(),
            clock.clone(),
        );

        let event = latest_event(&clock);
        let alert = dispatcher.dispatch(ThresholdCategory::InjectionAttempts, &event, 3).await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "sec@example.com");
        assert_eq!(sent[0].subject, "Guardrail Security Alert - injection_attempts");
        assert!(sent[0].body.contains("3 events in 300 seconds"));
        assert!(sent[0].body.contains("IP Address: 203.0.113.9"));
        assert!(sent[0].body.contains("User Agent: sqlmap/1.7"));
        assert!(sent[0].body.contains("Endpoint: POST /api/assessments"));
        assert!(sent[0].body.contains("User: user-7"));

        assert_eq!(alert.alert_type, THRESHOLD_ALERT_TYPE);
        assert_eq!(alert.count, 3);
        assert_eq!(alert.timeframe, 300);
        assert!(!alert.resolved);
        assert_eq!(alert.alert_details["severity"], "CRITICAL");
        assert_eq!(alert.alert_details["delivered"], 1);

        let stored = log.alerts(false).await.unwrap();
        assert_eq!(stored, vec![alert]);
    }

    #[tokio::test]
    async fn test_dispatch_without_recipients_still_records() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let log = EventLog::new(Arc::new(MemoryEventStore::new()));
        let dispatcher = AlertDispatcher::new(
            "Guardrail",
            Vec::new(),
            Arc::new(LogNotificationSink),
            Thresholds::default(),
            log.clone(),
            clock.clone(),
        );

        dispatcher
            .dispatch(ThresholdCategory::FailedLogins, &latest_event(&clock), 5)
            .await;
        assert_eq!(log.alerts(true).await.unwrap().len(), 1);
    }
}
