// CSRF Protection - OWASP A01: stateless signed tokens
//
// Wire format: `session_id:issued_at:signature`, where signature is
// HMAC-SHA256(secret, "session_id:issued_at") in unpadded URL-safe base64.
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::error::{TokenError, TokenFailure};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;
pub const DEFAULT_REGISTRY_SIZE: usize = 10;
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 30;

/// Issues and validates CSRF tokens. Validation needs nothing but the secret
/// and the clock.
pub struct TokenService {
    mac: HmacSha256,
    lifetime: Duration,
    max_skew: Duration,
    clock: Arc<dyn Clock>,
    registry: Option<TokenRegistry>,
}

impl TokenService {
    pub fn new(secret: &SecretString, clock: Arc<dyn Clock>) -> Result<Self, TokenError> {
        let key = secret.expose_secret().as_bytes();
        if key.is_empty() {
            return Err(TokenError::EmptySecret);
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|_| TokenError::EmptySecret)?;

        Ok(Self {
            mac,
            lifetime: Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS),
            max_skew: Duration::seconds(DEFAULT_MAX_CLOCK_SKEW_SECS),
            clock,
            registry: None,
        })
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_max_skew(mut self, max_skew: Duration) -> Self {
        self.max_skew = max_skew;
        self
    }

    /// Keep the last `capacity` tokens per session for audit. Never consulted
    /// by `validate`.
    pub fn with_registry(mut self, capacity: usize) -> Self {
        self.registry = Some(TokenRegistry::new(capacity));
        self
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn registry(&self) -> Option<&TokenRegistry> {
        self.registry.as_ref()
    }

    /// Expire old registry entries without waiting for the next `generate`.
    pub fn purge_registry(&self) -> usize {
        self.registry
            .as_ref()
            .map(|r| r.purge_expired(self.clock.now(), self.lifetime))
            .unwrap_or(0)
    }

    /// Two calls for the same session within the same second yield the same
    /// token.
    pub fn generate(&self, session_id: &str) -> Result<String, TokenError> {
        if session_id.is_empty() || session_id.contains(':') {
            return Err(TokenError::InvalidSessionId);
        }

        let now = self.clock.now();
        let payload = format!("{}:{}", session_id, now.timestamp());
        let token = format!("{}:{}", payload, self.sign(&payload));

        if let Some(registry) = &self.registry {
            registry.record(session_id, &token, now, self.lifetime);
        }

        Ok(token)
    }

    /// True only for an untampered, unexpired token bound to `session_id`.
    pub fn validate(&self, token: &str, session_id: &str) -> bool {
        self.verify(token, session_id).is_ok()
    }

    /// Same check as `validate`, keeping the failure reason for logs.
    pub fn verify(&self, token: &str, session_id: &str) -> Result<(), TokenFailure> {
        let parts: Vec<&str> = token.split(':').collect();
        let [token_session, issued_at, signature] = parts.as_slice() else {
            return Err(TokenFailure::Malformed);
        };

        if *token_session != session_id {
            return Err(TokenFailure::SessionMismatch);
        }

        let issued_secs: i64 = issued_at.parse().map_err(|_| TokenFailure::Malformed)?;
        if issued_secs < 0 {
            return Err(TokenFailure::Malformed);
        }
        let age = self
            .clock
            .now()
            .timestamp()
            .checked_sub(issued_secs)
            .ok_or(TokenFailure::Malformed)?;
        if age > self.lifetime.num_seconds() {
            return Err(TokenFailure::Expired);
        }
        if -age > self.max_skew.num_seconds() {
            return Err(TokenFailure::IssuedInFuture);
        }

        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenFailure::BadSignature)?;
        let mut mac = self.mac.clone();
        mac.update(format!("{}:{}", token_session, issued_at).as_bytes());
        // verify_slice compares in constant time
        mac.verify_slice(&provided)
            .map_err(|_| TokenFailure::BadSignature)
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
}

/// Bounded per-session record of issued tokens.
#[derive(Debug)]
pub struct TokenRegistry {
    capacity: usize,
    sessions: Mutex<HashMap<String, VecDeque<IssuedToken>>>,
}

impl TokenRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, session_id: &str, token: &str, now: DateTime<Utc>, lifetime: Duration) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let issued = sessions.entry(session_id.to_string()).or_default();
        issued.push_back(IssuedToken {
            token: token.to_string(),
            issued_at: now,
        });
        while issued.len() > self.capacity {
            issued.pop_front();
        }

        Self::cleanup_expired(&mut sessions, now, lifetime);
    }

    pub fn tokens_for(&self, session_id: &str) -> Vec<IssuedToken> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .map(|issued| issued.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget every token recorded for a session, e.g. on logout.
    pub fn revoke_session(&self, session_id: &str) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session_id).map(|t| t.len()).unwrap_or(0)
    }

    /// Drop expired tokens and sessions left empty. Returns the number of
    /// sessions removed.
    pub fn purge_expired(&self, now: DateTime<Utc>, lifetime: Duration) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Self::cleanup_expired(&mut sessions, now, lifetime)
    }

    fn cleanup_expired(
        sessions: &mut HashMap<String, VecDeque<IssuedToken>>,
        now: DateTime<Utc>,
        lifetime: Duration,
    ) -> usize {
        let before = sessions.len();
        sessions.retain(|_, issued| {
            issued.retain(|t| now - t.issued_at <= lifetime);
            !issued.is_empty()
        });
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const T0: i64 = 1_700_000_000;

    fn service(clock: Arc<ManualClock>) -> TokenService {
        TokenService::new(&SecretString::new("test_secret".to_string()), clock).unwrap()
    }

    #[test]
    fn test_token_binds_to_session() {
        let clock = Arc::new(ManualClock::at_unix(T0));
        let tokens = service(clock);

        for session in ["abc", "user-42", "9f1c2e"] {
            let token = tokens.generate(session).unwrap();
            assert!(tokens.validate(&token, session));
            assert!(!tokens.validate(&token, "someone-else"));
            assert_eq!(
                tokens.verify(&token, "someone-else"),
                Err(TokenFailure::SessionMismatch)
            );
        }
    }

    #[test]
    fn test_lifetime_boundary_is_inclusive() {
        let clock = Arc::new(ManualClock::at_unix(T0));
        let tokens = service(clock.clone());
        let token = tokens.generate("s1").unwrap();

        clock.advance(Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));
        assert!(tokens.validate(&token, "s1"));

        clock.advance(Duration::seconds(1));
        assert_eq!(tokens.verify(&token, "s1"), Err(TokenFailure::Expired));
    }

    #[test]
    fn test_flipped_signature_character_rejected() {
        let clock = Arc::new(ManualClock::at_unix(T0));
        let tokens = service(clock);
        let token = tokens.generate("s1").unwrap();
        let sig_start = token.rfind(':').unwrap() + 1;

        for i in sig_start..token.len() {
            let mut bytes = token.clone().into_bytes();
            bytes[i] = if bytes[i] == b'A' { b'B' } else { b'A' };
            let tampered = String::from_utf8(bytes).unwrap();
            assert!(!tokens.validate(&tampered, "s1"), "flip at {i} accepted");
        }
    }

    #[test]
    fn test_other_secret_rejected() {
        let clock = Arc::new(ManualClock::at_unix(T0));
        let issuer = service(clock.clone());
        let other = TokenService::new(&SecretString::new("other".to_string()), clock).unwrap();

        let token = issuer.generate("s1").unwrap();
        assert_eq!(other.verify(&token, "s1"), Err(TokenFailure::BadSignature));
    }

    #[test]
    fn test_malformed_tokens() {
        let tokens = service(Arc::new(ManualClock::at_unix(T0)));
        for bad in ["", "s1", "s1:123", "s1:123:sig:extra", "s1:notanumber:sig"] {
            assert_eq!(tokens.verify(bad, "s1"), Err(TokenFailure::Malformed), "{bad}");
        }
    }

    #[test]
    fn test_out_of_range_issued_at() {
        let tokens = service(Arc::new(ManualClock::at_unix(T0)));

        let min = format!("s1:{}:AAAA", i64::MIN);
        assert!(!tokens.validate(&min, "s1"));
        assert_eq!(tokens.verify(&min, "s1"), Err(TokenFailure::Malformed));
        assert_eq!(tokens.verify("s1:-1:AAAA", "s1"), Err(TokenFailure::Malformed));
        assert_eq!(
            tokens.verify(&format!("s1:{}:AAAA", i64::MAX), "s1"),
            Err(TokenFailure::IssuedInFuture)
        );
    }

    #[test]
    fn test_future_issued_at_rejected() {
        let clock = Arc::new(ManualClock::at_unix(T0));
        let tokens = service(clock.clone());
        let token = tokens.generate("s1").unwrap();

        clock.advance(Duration::seconds(-(DEFAULT_MAX_CLOCK_SKEW_SECS + 1)));
        assert_eq!(tokens.verify(&token, "s1"), Err(TokenFailure::IssuedInFuture));
    }

    #[test]
    fn test_uniqueness_follows_clock_granularity() {
        let clock = Arc::new(ManualClock::at_unix(T0));
        let tokens = service(clock.clone());

        let first = tokens.generate("s1").unwrap();
        assert_eq!(first, tokens.generate("s1").unwrap());

        clock.advance(Duration::seconds(1));
        assert_ne!(first, tokens.generate("s1").unwrap());
    }

    #[test]
    fn test_invalid_session_id() {
        let tokens = service(Arc::new(ManualClock::at_unix(T0)));
        assert_eq!(tokens.generate(""), Err(TokenError::InvalidSessionId));
        assert_eq!(tokens.generate("a:b"), Err(TokenError::InvalidSessionId));
        assert!(TokenService::new(&SecretString::new(String::new()), Arc::new(ManualClock::at_unix(T0))).is_err());
    }

    #[test]
    fn test_registry_is_bounded_and_not_authoritative() {
        let clock = Arc::new(ManualClock::at_unix(T0));
        let tokens = service(clock.clone()).with_registry(DEFAULT_REGISTRY_SIZE);

        let oldest = tokens.generate("s1").unwrap();
        for _ in 0..11 {
            clock.advance(Duration::seconds(1));
            tokens.generate("s1").unwrap();
        }

        let registry = tokens.registry().unwrap();
        let recorded = registry.tokens_for("s1");
        assert_eq!(recorded.len(), DEFAULT_REGISTRY_SIZE);
        assert!(recorded.iter().all(|t| t.token != oldest));
        assert!(tokens.validate(&oldest, "s1"));

        assert_eq!(registry.revoke_session("s1"), DEFAULT_REGISTRY_SIZE);
        assert!(registry.tokens_for("s1").is_empty());
        assert!(tokens.validate(&oldest, "s1"));
    }

    #[test]
    fn test_registry_drops_expired_sessions() {
        let clock = Arc::new(ManualClock::at_unix(T0));
        let tokens = service(clock.clone()).with_registry(DEFAULT_REGISTRY_SIZE);

        tokens.generate("old").unwrap();
        clock.advance(Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS + 1));
        tokens.generate("new").unwrap();

        let registry = tokens.registry().unwrap();
        assert!(registry.tokens_for("old").is_empty());
        assert_eq!(registry.tokens_for("new").len(), 1);

        clock.advance(Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS + 1));
        assert_eq!(tokens.purge_registry(), 1);
        assert!(registry.tokens_for("new").is_empty());
        assert_eq!(service(clock).purge_registry(), 0);
    }
}
