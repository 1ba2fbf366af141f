// Bucketed threshold counting over a shared counting cache
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::clock::Clock;
use crate::error::StorageError;
use crate::event::{Severity, ThresholdCategory};

/// Shared counting store keyed by string with per-key expiry.
/// Implementations must make `increment` atomic.
#[async_trait]
pub trait CounterCache: Send + Sync {
    /// Add one to `key` and return the new value. A missing or expired key
    /// starts from zero and receives `ttl`; an existing key keeps its expiry.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StorageError>;

    async fn get(&self, key: &str) -> Result<u64, StorageError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: u64,
    expires_at: DateTime<Utc>,
}

const PURGE_THRESHOLD: usize = 4096;

/// In-process counting cache. Atomicity comes from a single lock.
pub struct MemoryCounterCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CounterEntry>>,
}

impl MemoryCounterCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every expired key. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl CounterCache for MemoryCounterCache {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StorageError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        if entries.len() > PURGE_THRESHOLD {
            entries.retain(|_, e| e.expires_at > now);
        }

        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if e.expires_at <= now {
                    *e = CounterEntry { value: 0, expires_at: now + ttl };
                }
            })
            .or_insert(CounterEntry { value: 0, expires_at: now + ttl });
        entry.value += 1;

        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<u64, StorageError> {
        let now = self.clock.now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value)
            .unwrap_or(0))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = now + ttl;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub count: u64,
    pub window_secs: u64,
    pub severity: Severity,
}

impl ThresholdRule {
    const fn new(count: u64, window_secs: u64, severity: Severity) -> Self {
        Self { count, window_secs, severity }
    }
}

/// Alert threshold for every category. One field per category keeps the
/// mapping exhaustive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub failed_logins: ThresholdRule,
    pub injection_attempts: ThresholdRule,
    pub rate_limit_violations: ThresholdRule,
    pub assessment_anomalies: ThresholdRule,
    pub suspicious_activities: ThresholdRule,
    pub brute_force_attempts: ThresholdRule,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            failed_logins: ThresholdRule::new(5, 300, Severity::Warning),
            injection_attempts: ThresholdRule::new(3, 300, Severity::Critical),
            rate_limit_violations: ThresholdRule::new(10, 600, Severity::Warning),
            assessment_anomalies: ThresholdRule::new(2, 3600, Severity::Warning),
            suspicious_activities: ThresholdRule::new(5, 1800, Severity::Warning),
            brute_force_attempts: ThresholdRule::new(10, 300, Severity::Critical),
        }
    }
}

impl Thresholds {
    pub fn rule(&self, category: ThresholdCategory) -> &ThresholdRule {
        match category {
            ThresholdCategory::FailedLogins => &self.failed_logins,
            ThresholdCategory::InjectionAttempts => &self.injection_attempts,
            ThresholdCategory::RateLimitViolations => &self.rate_limit_violations,
            ThresholdCategory::AssessmentAnomalies => &self.assessment_anomalies,
            ThresholdCategory::SuspiciousActivities => &self.suspicious_activities,
            ThresholdCategory::BruteForceAttempts => &self.brute_force_attempts,
        }
    }
}

/// Count-with-expiry per `(category, floor(now / window))`.
///
/// Only the current bucket is counted, so a burst that straddles a bucket
/// boundary is split across two counts. This is an approximation of a
/// sliding window, not a sliding window.
pub struct ThresholdCounter {
    cache: Arc<dyn CounterCache>,
    thresholds: Thresholds,
    clock: Arc<dyn Clock>,
}

impl ThresholdCounter {
    pub fn new(cache: Arc<dyn CounterCache>, thresholds: Thresholds, clock: Arc<dyn Clock>) -> Self {
        Self { cache, thresholds, clock }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn bucket_key(&self, category: ThresholdCategory) -> String {
        let window = self.thresholds.rule(category).window_secs.max(1) as i64;
        let bucket = self.clock.now().timestamp().div_euclid(window);
        format!("security_threshold:{}:{}", category, bucket)
    }

    /// Count for the current bucket after this increment. Returns 0 when the
    /// cache is unavailable so the caller skips alerting but keeps going.
    pub async fn increment_and_get(&self, category: ThresholdCategory) -> u64 {
        let key = self.bucket_key(category);
        let ttl = Duration::seconds(self.thresholds.rule(category).window_secs as i64);

        match self.cache.increment(&key, ttl).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Threshold counter unavailable for {}: {}", category, e);
                0
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;

    // Multiple of 300, 600, 1800 and 3600
    pub(crate) const ALIGNED: i64 = 1_699_999_200;

    pub(crate) struct UnavailableCache;

    #[async_trait]
    impl CounterCache for UnavailableCache {
        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, StorageError> {
            Err(StorageError::Unavailable("cache down".to_string()))
        }

        async fn get(&self, _key: &str) -> Result<u64, StorageError> {
            Err(StorageError::Unavailable("cache down".to_string()))
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("cache down".to_string()))
        }
    }

    fn counter(clock: Arc<ManualClock>) -> ThresholdCounter {
        let cache = Arc::new(MemoryCounterCache::new(clock.clone()));
        ThresholdCounter::new(cache, Thresholds::default(), clock)
    }

    #[test]
    fn test_default_table() {
        let t = Thresholds::default();
        assert_eq!(t.rule(ThresholdCategory::FailedLogins), &ThresholdRule::new(5, 300, Severity::Warning));
        assert_eq!(t.rule(ThresholdCategory::InjectionAttempts), &ThresholdRule::new(3, 300, Severity::Critical));
        assert_eq!(t.rule(ThresholdCategory::RateLimitViolations), &ThresholdRule::new(10, 600, Severity::Warning));
        assert_eq!(t.rule(ThresholdCategory::AssessmentAnomalies), &ThresholdRule::new(2, 3600, Severity::Warning));
        assert_eq!(t.rule(ThresholdCategory::SuspiciousActivities), &ThresholdRule::new(5, 1800, Severity::Warning));
        assert_eq!(t.rule(ThresholdCategory::BruteForceAttempts), &ThresholdRule::new(10, 300, Severity::Critical));
    }

    #[tokio::test]
    async fn test_memory_cache_expiry() {
        let clock = Arc::new(ManualClock::at_unix(ALIGNED));
        let cache = MemoryCounterCache::new(clock.clone());

        assert_eq!(cache.increment("k", Duration::seconds(10)).await.unwrap(), 1);
        assert_eq!(cache.increment("k", Duration::seconds(10)).await.unwrap(), 2);
        assert_eq!(cache.get("k").await.unwrap(), 2);

        // Second increment must not have pushed the expiry out
        clock.advance(Duration::seconds(10));
        assert_eq!(cache.get("k").await.unwrap(), 0);
        assert_eq!(cache.increment("k", Duration::seconds(10)).await.unwrap(), 1);

        cache.expire("k", Duration::seconds(0)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), 0);
        assert_eq!(cache.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_counts_are_monotonic_within_bucket() {
        let clock = Arc::new(ManualClock::at_unix(ALIGNED));
        let counter = counter(clock.clone());

        let mut last = 0;
        for _ in 0..5 {
            clock.advance(Duration::seconds(30));
            let count = counter.increment_and_get(ThresholdCategory::FailedLogins).await;
            assert_eq!(count, last + 1);
            last = count;
        }
    }

    #[tokio::test]
    async fn test_reset_exactly_at_bucket_boundary() {
        let clock = Arc::new(ManualClock::at_unix(ALIGNED + 299));
        let counter = counter(clock.clone());

        assert_eq!(counter.increment_and_get(ThresholdCategory::FailedLogins).await, 1);
        assert_eq!(counter.increment_and_get(ThresholdCategory::FailedLogins).await, 2);

        // One second later is a new bucket: the straddling burst is split
        clock.advance(Duration::seconds(1));
        assert_eq!(counter.increment_and_get(ThresholdCategory::FailedLogins).await, 1);
    }

    #[tokio::test]
    async fn test_categories_count_independently() {
        let clock = Arc::new(ManualClock::at_unix(ALIGNED));
        let counter = counter(clock);

        counter.increment_and_get(ThresholdCategory::FailedLogins).await;
        assert_eq!(counter.increment_and_get(ThresholdCategory::InjectionAttempts).await, 1);
        assert_ne!(
            counter.bucket_key(ThresholdCategory::FailedLogins),
            counter.bucket_key(ThresholdCategory::InjectionAttempts)
        );
    }

    #[tokio::test]
    async fn test_fails_open_when_cache_unavailable() {
        let clock = Arc::new(ManualClock::at_unix(ALIGNED));
        let counter = ThresholdCounter::new(Arc::new(UnavailableCache), Thresholds::default(), clock);

        assert_eq!(counter.increment_and_get(ThresholdCategory::InjectionAttempts).await, 0);
    }
}
