//! Request protection and security event monitoring.
//!
//! Inbound requests are checked by a [`TokenService`] (CSRF) and a
//! [`ThreatClassifier`] (injection patterns). Violations become
//! [`SecurityEvent`]s handed to the [`SecurityMonitor`], which appends them to
//! the [`EventLog`], counts them per category with a [`ThresholdCounter`] and
//! asks the [`AlertDispatcher`] to notify once a category crosses its
//! threshold.
pub mod alert;
pub mod anomaly;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod counter;
pub mod error;
pub mod event;
pub mod monitor;
pub mod store;
pub mod token;

pub use alert::{AlertDispatcher, LogNotificationSink, NotificationSink};
pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalyFinding, AnomalyKind, AssessmentData};
pub use classifier::{AttackType, RejectReason, ThreatClassifier, ValidationOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SecurityConfig;
pub use counter::{CounterCache, MemoryCounterCache, ThresholdCounter, ThresholdRule, Thresholds};
pub use error::{ConfigError, DispatchError, StorageError, TokenError, TokenFailure};
pub use event::{
    RequestContext, SecurityAlert, SecurityEvent, SecurityEventType, Severity, ThresholdCategory,
};
pub use monitor::SecurityMonitor;
pub use store::{EventLog, EventStore, MemoryEventStore};
pub use token::{IssuedToken, TokenService};

use std::sync::Arc;

/// Builds the monitoring pipeline from configuration around the given
/// collaborators.
pub fn build_monitor(
    config: &SecurityConfig,
    store: Arc<dyn EventStore>,
    cache: Arc<dyn CounterCache>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
) -> SecurityMonitor {
    let event_log = EventLog::new(store);
    let counter = ThresholdCounter::new(cache, config.thresholds.clone(), clock.clone());
    let dispatcher = AlertDispatcher::new(
        config.app_name.clone(),
        config.alerts.recipients.clone(),
        sink,
        config.thresholds.clone(),
        event_log.clone(),
        clock.clone(),
    );

    SecurityMonitor::new(
        event_log,
        counter,
        dispatcher,
        AnomalyDetector::new(config.anomaly.clone()),
        clock,
    )
}

/// Token service with lifetime, skew and registry size from configuration.
pub fn build_token_service(
    config: &SecurityConfig,
    clock: Arc<dyn Clock>,
) -> Result<TokenService, TokenError> {
    Ok(TokenService::new(&config.csrf.signing_secret(), clock)?
        .with_lifetime(chrono::Duration::seconds(config.csrf.lifetime_secs))
        .with_max_skew(chrono::Duration::seconds(config.csrf.max_clock_skew_secs))
        .with_registry(config.csrf.registry_size))
}
