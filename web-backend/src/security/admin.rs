// Bearer-key gate for the security review API
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use guardrail_core::{RequestContext, SecurityEventType, Severity};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;

use super::{context::request_context, Rejection};
use crate::state::AppState;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Constant-time comparison against the configured key. Nothing matches
/// when no key is configured.
pub fn admin_key_matches(expected: Option<&SecretString>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (Some(expected), Some(provided)) => {
            let expected = expected.expose_secret().as_bytes();
            !expected.is_empty() && bool::from(expected.ct_eq(provided.as_bytes()))
        }
        _ => false,
    }
}

/// Rejects review requests without the admin bearer key and records the
/// attempt as suspicious activity.
pub async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if admin_key_matches(state.admin_key.as_ref(), bearer_token(request.headers())) {
        return next.run(request).await;
    }

    let context = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_else(|| request_context(&request, state.trust_proxy_headers));
    let mut details = Map::new();
    details.insert("reason".to_string(), Value::from("admin_auth_failed"));

    state
        .monitor
        .log_security_event(SecurityEventType::SuspiciousActivity, None, details, Severity::Warning, &context)
        .await;

    Rejection::Unauthorized.into_response()
}
