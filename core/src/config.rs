// Configuration: optional file layered under GUARDRAIL__* environment variables
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use crate::alert::{LogNotificationSink, NotificationSink};
use crate::anomaly::AnomalyConfig;
use crate::classifier::DEFAULT_MAX_INPUT_CHARS;
use crate::counter::Thresholds;
use crate::error::{ConfigError, DispatchError};
use crate::event::ThresholdCategory;
use crate::token::{DEFAULT_MAX_CLOCK_SKEW_SECS, DEFAULT_REGISTRY_SIZE, DEFAULT_TOKEN_LIFETIME_SECS};

pub const ENV_PREFIX: &str = "GUARDRAIL";
pub const CONFIG_PATH_VAR: &str = "GUARDRAIL_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "guardrail";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Used in alert subjects and bodies.
    pub app_name: String,
    pub server: ServerSettings,
    pub csrf: CsrfSettings,
    pub classifier: ClassifierSettings,
    pub thresholds: Thresholds,
    pub anomaly: AnomalyConfig,
    pub alerts: AlertSettings,
    pub rate_limit: RateLimitSettings,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            app_name: "Guardrail".to_string(),
            server: ServerSettings::default(),
            csrf: CsrfSettings::default(),
            classifier: ClassifierSettings::default(),
            thresholds: Thresholds::default(),
            anomaly: AnomalyConfig::default(),
            alerts: AlertSettings::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// SQLite URL for the persistent event store, e.g. `sqlite://guardrail.db`.
    /// In-memory storage when unset.
    pub database_url: Option<String>,
    /// Take the client address from `X-Forwarded-For`/`X-Real-IP`. Only safe
    /// behind a proxy that overwrites those headers.
    pub trust_proxy_headers: bool,
    /// Bearer key for the review API. Review routes refuse every request
    /// while unset.
    pub admin_key: Option<SecretString>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            log_level: "info".to_string(),
            database_url: None,
            trust_proxy_headers: false,
            admin_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CsrfSettings {
    pub secret: Option<SecretString>,
    pub lifetime_secs: i64,
    pub registry_size: usize,
    pub max_clock_skew_secs: i64,
}

impl Default for CsrfSettings {
    fn default() -> Self {
        Self {
            secret: None,
            lifetime_secs: DEFAULT_TOKEN_LIFETIME_SECS,
            registry_size: DEFAULT_REGISTRY_SIZE,
            max_clock_skew_secs: DEFAULT_MAX_CLOCK_SKEW_SECS,
        }
    }
}

impl CsrfSettings {
    /// The configured secret, or a fresh random one. A generated secret does
    /// not survive restarts, so outstanding tokens stop validating.
    pub fn signing_secret(&self) -> SecretString {
        match &self.secret {
            Some(secret) if !secret.expose_secret().is_empty() => secret.clone(),
            _ => {
                warn!("No CSRF secret configured, generating an ephemeral one");
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                SecretString::new(URL_SAFE_NO_PAD.encode(bytes))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub max_input_chars: usize,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self { max_input_chars: DEFAULT_MAX_INPUT_CHARS }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub from: String,
    pub recipients: Vec<String>,
    pub smtp: Option<SmtpSettings>,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            from: "security@localhost".to_string(),
            recipients: Vec::new(),
            smtp: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_requests: u64,
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_secs: 60,
        }
    }
}

impl SecurityConfig {
    /// Loads `$GUARDRAIL_CONFIG` (or `guardrail.{toml,json,yaml}` if present)
    /// and then `GUARDRAIL__SECTION__KEY` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("alerts.recipients"),
            );
        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config: SecurityConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.csrf.lifetime_secs <= 0 {
            return Err(ConfigError::Invalid("csrf.lifetime_secs must be positive".to_string()));
        }
        if self.csrf.max_clock_skew_secs < 0 {
            return Err(ConfigError::Invalid("csrf.max_clock_skew_secs must not be negative".to_string()));
        }
        if self.classifier.max_input_chars == 0 {
            return Err(ConfigError::Invalid("classifier.max_input_chars must be positive".to_string()));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit values must be positive".to_string()));
        }

        for category in ThresholdCategory::ALL {
            let rule = self.thresholds.rule(category);
            if rule.count == 0 || rule.window_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.{} needs a positive count and window",
                    category
                )));
            }
        }

        for (assessment_type, range) in &self.anomaly.score_ranges {
            if range.min > range.max {
                return Err(ConfigError::Invalid(format!(
                    "anomaly.score_ranges.{} has min above max",
                    assessment_type
                )));
            }
        }

        Ok(())
    }

    /// SMTP when configured and compiled in, otherwise the log sink.
    pub fn notification_sink(&self) -> Result<Arc<dyn NotificationSink>, DispatchError> {
        match &self.alerts.smtp {
            #[cfg(feature = "smtp")]
            Some(smtp) => Ok(Arc::new(crate::alert::SmtpNotificationSink::new(smtp, &self.alerts.from)?)),
            #[cfg(not(feature = "smtp"))]
            Some(smtp) => {
                warn!(
                    "SMTP relay {} configured but the smtp feature is disabled; alerts go to the log",
                    smtp.host
                );
                Ok(Arc::new(LogNotificationSink))
            }
            None => Ok(Arc::new(LogNotificationSink)),
        }
    }
}
