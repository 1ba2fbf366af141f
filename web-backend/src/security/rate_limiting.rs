// Fixed-window request limiting per client address
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Duration;
use guardrail_core::{Clock, CounterCache, RequestContext, SecurityEventType, Severity};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;

use super::{context::request_context, Rejection};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Over the limit. `first` is set only for the request that crossed it.
    Limited { count: u64, first: bool },
}

/// Counts requests per address in windows of `window_secs`, sharing the
/// counting cache with the threshold counter.
#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn CounterCache>,
    clock: Arc<dyn Clock>,
    max_requests: u64,
    window_secs: u64,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn CounterCache>, clock: Arc<dyn Clock>, max_requests: u64, window_secs: u64) -> Self {
        Self {
            cache,
            clock,
            max_requests,
            window_secs: window_secs.max(1),
        }
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn bucket_key(&self, ip: &str) -> String {
        let bucket = self.clock.now().timestamp().div_euclid(self.window_secs as i64);
        format!("rate_limit:{}:{}", ip, bucket)
    }

    /// Counter failures let the request through.
    pub async fn check(&self, ip: &str) -> RateDecision {
        let key = self.bucket_key(ip);
        let ttl = Duration::seconds(self.window_secs as i64);

        match self.cache.increment(&key, ttl).await {
            Ok(count) if count > self.max_requests => RateDecision::Limited {
                count,
                first: count == self.max_requests + 1,
            },
            Ok(_) => RateDecision::Allowed,
            Err(e) => {
                warn!("Rate limit counter unavailable for {}: {}", ip, e);
                RateDecision::Allowed
            }
        }
    }
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let context = request_context(&request, state.trust_proxy_headers);
    let ip = context.ip_address.clone().unwrap_or_else(|| "unknown".to_string());

    match state.rate_limiter.check(&ip).await {
        RateDecision::Allowed => next.run(request).await,
        RateDecision::Limited { count, first } => {
            if first {
                log_violation(&state, &context, count).await;
            }
            Rejection::RateLimited.into_response()
        }
    }
}

async fn log_violation(state: &AppState, context: &RequestContext, count: u64) {
    let details = match json!({
        "count": count,
        "limit": state.rate_limiter.max_requests(),
    }) {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    state
        .monitor
        .log_security_event(
            SecurityEventType::RateLimitExceeded,
            None,
            details,
            Severity::Warning,
            context,
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_core::{ManualClock, MemoryCounterCache};

    fn limiter(max: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_699_999_200));
        let cache = Arc::new(MemoryCounterCache::new(clock.clone()));
        (RateLimiter::new(cache, clock.clone(), max, 60), clock)
    }

    #[tokio::test]
    async fn test_limit_per_window() {
        let (limiter, clock) = limiter(2);

        assert_eq!(limiter.check("10.0.0.1").await, RateDecision::Allowed);
        assert_eq!(limiter.check("10.0.0.1").await, RateDecision::Allowed);
        assert_eq!(
            limiter.check("10.0.0.1").await,
            RateDecision::Limited { count: 3, first: true }
        );
        assert_eq!(
            limiter.check("10.0.0.1").await,
            RateDecision::Limited { count: 4, first: false }
        );

        // Other clients are counted separately
        assert_eq!(limiter.check("10.0.0.2").await, RateDecision::Allowed);

        clock.advance(Duration::seconds(60));
        assert_eq!(limiter.check("10.0.0.1").await, RateDecision::Allowed);
    }

    #[tokio::test]
    async fn test_bucket_key() {
        let (limiter, _) = limiter(5);
        assert_eq!(limiter.bucket_key("10.0.0.1"), "rate_limit:10.0.0.1:28333320");
    }
}
