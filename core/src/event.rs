// Security event taxonomy and the records persisted by the event log
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

const UNKNOWN: &str = "unknown";
const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    FailedLogin,
    LoginSuccess,
    BruteForce,
    SqlInjectionAttempt,
    XssAttempt,
    CommandInjectionAttempt,
    NosqlInjectionAttempt,
    PathTraversalAttempt,
    CsrfFailure,
    RateLimitExceeded,
    AssessmentAnomaly,
    SuspiciousActivity,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailedLogin => "failed_login",
            Self::LoginSuccess => "login_success",
            Self::BruteForce => "brute_force",
            Self::SqlInjectionAttempt => "sql_injection_attempt",
            Self::XssAttempt => "xss_attempt",
            Self::CommandInjectionAttempt => "command_injection_attempt",
            Self::NosqlInjectionAttempt => "nosql_injection_attempt",
            Self::PathTraversalAttempt => "path_traversal_attempt",
            Self::CsrfFailure => "csrf_failure",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::AssessmentAnomaly => "assessment_anomaly",
            Self::SuspiciousActivity => "suspicious_activity",
        }
    }

    /// Threshold bucket this event counts against, if any.
    pub fn category(&self) -> Option<ThresholdCategory> {
        match self {
            Self::FailedLogin => Some(ThresholdCategory::FailedLogins),
            Self::LoginSuccess => None,
            Self::BruteForce => Some(ThresholdCategory::BruteForceAttempts),
            Self::SqlInjectionAttempt
            | Self::XssAttempt
            | Self::CommandInjectionAttempt
            | Self::NosqlInjectionAttempt
            | Self::PathTraversalAttempt => Some(ThresholdCategory::InjectionAttempts),
            Self::CsrfFailure | Self::SuspiciousActivity => {
                Some(ThresholdCategory::SuspiciousActivities)
            }
            Self::RateLimitExceeded => Some(ThresholdCategory::RateLimitViolations),
            Self::AssessmentAnomaly => Some(ThresholdCategory::AssessmentAnomalies),
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdCategory {
    FailedLogins,
    InjectionAttempts,
    RateLimitViolations,
    AssessmentAnomalies,
    SuspiciousActivities,
    BruteForceAttempts,
}

impl ThresholdCategory {
    pub const ALL: [ThresholdCategory; 6] = [
        Self::FailedLogins,
        Self::InjectionAttempts,
        Self::RateLimitViolations,
        Self::AssessmentAnomalies,
        Self::SuspiciousActivities,
        Self::BruteForceAttempts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailedLogins => "failed_logins",
            Self::InjectionAttempts => "injection_attempts",
            Self::RateLimitViolations => "rate_limit_violations",
            Self::AssessmentAnomalies => "assessment_anomalies",
            Self::SuspiciousActivities => "suspicious_activities",
            Self::BruteForceAttempts => "brute_force_attempts",
        }
    }
}

impl fmt::Display for ThresholdCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        })
    }
}

/// Ambient request data captured when an event is logged. Every field is
/// optional; gaps are recorded as "unknown".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub endpoint: Option<String>,
    pub method: Option<String>,
}

impl RequestContext {
    /// Context for events raised outside any request (jobs, tests).
    pub fn detached() -> Self {
        Self::default()
    }
}

/// A single security-relevant occurrence. Built once by the monitor and
/// only ever appended; no API exists to change a stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: SecurityEventType,
    pub user_identifier: String,
    pub severity: Severity,
    pub ip_address: String,
    pub user_agent: String,
    pub endpoint: String,
    pub method: String,
    pub details: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub(crate) fn new(
        now: DateTime<Utc>,
        event_type: SecurityEventType,
        user_identifier: Option<&str>,
        details: Map<String, Value>,
        severity: Severity,
        context: &RequestContext,
    ) -> Self {
        let or_unknown = |v: &Option<String>| {
            v.as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(UNKNOWN)
                .to_string()
        };

        Self {
            id: Uuid::new_v4(),
            timestamp: now,
            event_type,
            user_identifier: user_identifier
                .filter(|u| !u.trim().is_empty())
                .unwrap_or(ANONYMOUS)
                .to_string(),
            severity,
            ip_address: or_unknown(&context.ip_address),
            user_agent: or_unknown(&context.user_agent),
            endpoint: or_unknown(&context.endpoint),
            method: or_unknown(&context.method),
            details,
            created_at: now,
        }
    }
}

/// Summary written every time a threshold alert is dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub id: Uuid,
    pub alert_type: String,
    pub event_type: ThresholdCategory,
    pub count: u64,
    pub timeframe: u64,
    pub alert_details: Value,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}
