// CSRF and injection screening for state-changing requests
use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use guardrail_core::{
    AttackType, RejectReason, RequestContext, SecurityEventType, Severity, ThreatClassifier, TokenFailure,
};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{
    context::{request_context, session_id},
    Rejection,
};
use crate::state::AppState;

pub const MAX_BODY_BYTES: usize = 64 * 1024;
pub const CSRF_HEADERS: [&str; 2] = ["x-csrf-token", "x-csrftoken"];
pub const CSRF_FIELD: &str = "csrf_token";
const MAX_LOGGED_PAYLOAD_CHARS: usize = 200;

/// A string pulled out of a request body, with the field it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Default)]
struct ParsedBody {
    token: Option<String>,
    fields: Vec<BodyField>,
}

fn is_state_changing(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// Runs on every request. All requests get a `RequestContext` extension;
/// state-changing ones must also carry a valid CSRF token and a body free of
/// injection patterns.
pub async fn request_guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let context = request_context(&request, state.trust_proxy_headers);
    let (mut parts, body) = request.into_parts();
    parts.extensions.insert(context.clone());

    if !is_state_changing(&parts.method) {
        return next.run(Request::from_parts(parts, body)).await;
    }

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Rejected request body: {}", e);
            return Rejection::BadRequest.into_response();
        }
    };

    let parsed = match parse_body(&parts.headers, &bytes) {
        Ok(parsed) => parsed,
        Err(rejection) => return rejection.into_response(),
    };

    let token = header_token(&parts.headers).or(parsed.token);
    if let Err(failure) = check_csrf(&state, &parts.headers, token.as_deref()) {
        log_csrf_failure(&state, &context, failure).await;
        return Rejection::CsrfFailed.into_response();
    }

    if let Err(rejection) = screen_fields(&state, state.classifier, &parsed.fields, &context).await {
        return rejection.into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

fn header_token(headers: &HeaderMap) -> Option<String> {
    CSRF_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Why a CSRF check failed, including the cases the token service never sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsrfFailure {
    MissingToken,
    MissingSession,
    Invalid(TokenFailure),
}

impl CsrfFailure {
    fn as_str(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::MissingSession => "missing_session",
            Self::Invalid(TokenFailure::Malformed) => "malformed",
            Self::Invalid(TokenFailure::SessionMismatch) => "session_mismatch",
            Self::Invalid(TokenFailure::Expired) => "expired",
            Self::Invalid(TokenFailure::IssuedInFuture) => "issued_in_future",
            Self::Invalid(TokenFailure::BadSignature) => "bad_signature",
        }
    }
}

fn check_csrf(state: &AppState, headers: &HeaderMap, token: Option<&str>) -> Result<(), CsrfFailure> {
    let token = token.ok_or(CsrfFailure::MissingToken)?;
    let session = session_id(headers).ok_or(CsrfFailure::MissingSession)?;
    state.tokens.verify(token, &session).map_err(CsrfFailure::Invalid)
}

async fn log_csrf_failure(state: &AppState, context: &RequestContext, failure: CsrfFailure) {
    let mut details = Map::new();
    details.insert("reason".to_string(), Value::from(failure.as_str()));

    state
        .monitor
        .log_security_event(SecurityEventType::CsrfFailure, None, details, Severity::Warning, context)
        .await;
}

fn parse_body(headers: &HeaderMap, bytes: &Bytes) -> Result<ParsedBody, Rejection> {
    if bytes.is_empty() {
        return Ok(ParsedBody::default());
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        let value: Value = serde_json::from_slice(bytes).map_err(|_| Rejection::BadRequest)?;
        let token = value
            .get(CSRF_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut fields = Vec::new();
        collect_strings("", &value, &mut fields);
        Ok(ParsedBody { token, fields })
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let mut parsed = ParsedBody::default();
        for (name, value) in url::form_urlencoded::parse(bytes) {
            if name == CSRF_FIELD {
                parsed.token = Some(value.into_owned());
            } else if !value.is_empty() {
                parsed.fields.push(BodyField {
                    name: name.into_owned(),
                    value: value.into_owned(),
                });
            }
        }
        Ok(parsed)
    } else {
        // Opaque bodies carry no fields to screen
        Ok(ParsedBody::default())
    }
}

/// Every non-empty string in `value`, object keys included, with dotted paths.
/// The top-level CSRF field is skipped.
pub fn collect_strings(path: &str, value: &Value, out: &mut Vec<BodyField>) {
    match value {
        Value::String(s) if !s.is_empty() => out.push(BodyField {
            name: path.to_string(),
            value: s.clone(),
        }),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_strings(&format!("{}[{}]", path, i), item, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                if path.is_empty() && key == CSRF_FIELD {
                    continue;
                }
                let child = if path.is_empty() { key.clone() } else { format!("{}.{}", path, key) };
                if !key.is_empty() {
                    out.push(BodyField {
                        name: format!("{}#key", child),
                        value: key.clone(),
                    });
                }
                collect_strings(&child, item, out);
            }
        }
        _ => {}
    }
}

async fn screen_fields(
    state: &AppState,
    classifier: ThreatClassifier,
    fields: &[BodyField],
    context: &RequestContext,
) -> Result<(), Rejection> {
    for field in fields {
        let outcome = classifier.validate_input(&field.value, &field.name);
        if outcome.valid {
            continue;
        }

        match (outcome.reason, outcome.attack_type) {
            (Some(RejectReason::ThreatDetected), Some(attack)) => {
                log_threat(state, attack, field, context).await;
                return Err(Rejection::InvalidInput);
            }
            // Whitespace-only values are not threats
            (Some(RejectReason::InvalidEmpty), _) => continue,
            _ => {
                debug!("Field {} rejected: {:?}", field.name, outcome.reason);
                return Err(Rejection::InvalidInput);
            }
        }
    }
    Ok(())
}

async fn log_threat(state: &AppState, attack: AttackType, field: &BodyField, context: &RequestContext) {
    let payload: String = field.value.chars().take(MAX_LOGGED_PAYLOAD_CHARS).collect();
    let details = match json!({
        "field": field.name,
        "attack_type": attack,
        "payload": payload,
    }) {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    state
        .monitor
        .log_security_event(attack.event_type(), None, details, Severity::Critical, context)
        .await;
}
