use guardrail_core::{
    build_monitor, build_token_service, Clock, CounterCache, EventStore, MemoryCounterCache, MemoryEventStore,
    NotificationSink, SecurityConfig, SecurityMonitor, SystemClock, ThreatClassifier, TokenService,
};
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

use crate::security::rate_limiting::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<SecurityMonitor>,
    pub tokens: Arc<TokenService>,
    pub classifier: ThreatClassifier,
    pub rate_limiter: RateLimiter,
    pub clock: Arc<dyn Clock>,
    /// Honor `X-Forwarded-For` / `X-Real-IP` for the client address.
    pub trust_proxy_headers: bool,
    /// Bearer key for the review routes; unset refuses them all.
    pub admin_key: Option<SecretString>,
}

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

impl AppState {
    pub async fn new(config: &SecurityConfig) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = event_store(config).await?;
        let memory_cache = Arc::new(MemoryCounterCache::new(clock.clone()));
        let cache: Arc<dyn CounterCache> = memory_cache.clone();
        let sink = config.notification_sink()?;
        info!("Security alerts delivered via {} sink", sink.name());

        let state = Self::from_parts(config, store, cache, sink, clock)?;
        state.spawn_maintenance(memory_cache);
        Ok(state)
    }

    /// Periodically drops expired counters and audit registry entries.
    fn spawn_maintenance(&self, cache: Arc<MemoryCounterCache>) {
        let tokens = self.tokens.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                let counters = cache.purge_expired().await;
                let sessions = tokens.purge_registry();
                if counters > 0 || sessions > 0 {
                    debug!("Purged {} expired counters and {} token sessions", counters, sessions);
                }
            }
        });
    }

    /// Assembles the state around explicit collaborators.
    pub fn from_parts(
        config: &SecurityConfig,
        store: Arc<dyn EventStore>,
        cache: Arc<dyn CounterCache>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let tokens = build_token_service(config, clock.clone())?;
        let rate_limiter = RateLimiter::new(
            cache.clone(),
            clock.clone(),
            config.rate_limit.max_requests,
            config.rate_limit.window_secs,
        );
        let monitor = build_monitor(config, store, cache, sink, clock.clone());

        Ok(Self {
            monitor: Arc::new(monitor),
            tokens: Arc::new(tokens),
            classifier: ThreatClassifier::new(config.classifier.max_input_chars),
            rate_limiter,
            clock,
            trust_proxy_headers: config.server.trust_proxy_headers,
            admin_key: config.server.admin_key.clone(),
        })
    }
}

#[cfg(feature = "database")]
async fn event_store(config: &SecurityConfig) -> anyhow::Result<Arc<dyn EventStore>> {
    match &config.server.database_url {
        Some(url) => {
            let store = crate::sqlite_store::SqliteEventStore::connect(url).await?;
            info!("Security events persisted to {}", url);
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryEventStore::new())),
    }
}

#[cfg(not(feature = "database"))]
async fn event_store(config: &SecurityConfig) -> anyhow::Result<Arc<dyn EventStore>> {
    if config.server.database_url.is_some() {
        tracing::warn!("database_url set but the database feature is disabled; events kept in memory");
    }
    Ok(Arc::new(MemoryEventStore::new()))
}
