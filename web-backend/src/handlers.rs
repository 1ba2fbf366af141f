use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    response::IntoResponse,
    Extension, Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Duration, Utc};
use guardrail_core::{AssessmentData, IssuedToken, RequestContext, SecurityAlert, SecurityEvent, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::{error, info};
use uuid::Uuid;
use validator::Validate;

use crate::security::{context::SESSION_COOKIE, Rejection};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct AssessmentSubmission {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,

    #[validate(length(min = 1, max = 64))]
    pub assessment_type: String,

    #[validate(range(min = 0.0))]
    pub completion_time: Option<f64>,

    #[serde(default)]
    pub responses: Map<String, serde_json::Value>,

    #[validate(range(min = 0.0, max = 100.0))]
    pub score: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub accepted: bool,
    pub flagged: usize,
}

#[derive(Debug, Deserialize)]
pub struct EventRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub revoked: usize,
}

#[derive(Debug, Deserialize)]
pub struct AlertFilter {
    #[serde(default)]
    pub unresolved: bool,
}

// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "guardrail-web",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Issues a token bound to the `session_id` cookie, minting the session when
/// the client has none.
pub async fn csrf_token(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, Json<CsrfTokenResponse>), Rejection> {
    let existing = jar
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty());

    let (jar, session) = match existing {
        Some(session) => (jar, session),
        None => {
            let session = Uuid::new_v4().to_string();
            let cookie = Cookie::build((SESSION_COOKIE, session.clone()))
                .http_only(true)
                .same_site(SameSite::Strict)
                .path("/");
            (jar.add(cookie), session)
        }
    };

    let token = state.tokens.generate(&session).map_err(|e| {
        error!("Failed to issue CSRF token: {}", e);
        Rejection::Internal
    })?;

    Ok((
        jar,
        Json(CsrfTokenResponse {
            csrf_token: token,
            expires_in: state.tokens.lifetime().num_seconds(),
        }),
    ))
}

pub async fn submit_assessment(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    payload: Result<Json<AssessmentSubmission>, JsonRejection>,
) -> Result<Json<SubmissionResponse>, Rejection> {
    let Json(submission) = payload.map_err(|_| Rejection::BadRequest)?;
    submission.validate().map_err(|_| Rejection::BadRequest)?;

    let data = AssessmentData {
        assessment_type: submission.assessment_type,
        completion_time: submission.completion_time,
        responses: submission.responses,
        score: submission.score,
    };

    let findings = state
        .monitor
        .screen_assessment(&submission.user_id, &data, &context)
        .await;
    if !findings.is_empty() {
        info!(
            "Assessment from {} flagged with {} anomalies",
            submission.user_id,
            findings.len()
        );
    }

    Ok(Json(SubmissionResponse {
        accepted: true,
        flagged: findings.len(),
    }))
}

/// Events in `[from, to)`. Without bounds, the last 24 hours up to and
/// including the current second.
pub async fn list_events(
    State(state): State<AppState>,
    range: Result<Query<EventRange>, QueryRejection>,
) -> Result<Json<Vec<SecurityEvent>>, Rejection> {
    let Query(range) = range.map_err(|_| Rejection::BadRequest)?;
    let now = state.clock.now();
    let to = range.to.unwrap_or(now + Duration::seconds(1));
    let from = range.from.unwrap_or(now - Duration::hours(24));
    if from > to {
        return Err(Rejection::BadRequest);
    }

    let events = state.monitor.events_between(from, to).await.map_err(storage_rejection)?;
    Ok(Json(events))
}

pub async fn list_alerts(
    State(state): State<AppState>,
    filter: Result<Query<AlertFilter>, QueryRejection>,
) -> Result<Json<Vec<SecurityAlert>>, Rejection> {
    let Query(filter) = filter.map_err(|_| Rejection::BadRequest)?;
    let alerts = state.monitor.alerts(filter.unresolved).await.map_err(storage_rejection)?;
    Ok(Json(alerts))
}

pub async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SecurityAlert>, Rejection> {
    let alert = state.monitor.resolve_alert(id).await.map_err(storage_rejection)?;
    Ok(Json(alert))
}

/// Audit view of the tokens recently issued to a session.
pub async fn session_tokens(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<IssuedToken>>, Rejection> {
    let registry = state.tokens.registry().ok_or(Rejection::NotFound)?;
    Ok(Json(registry.tokens_for(&session_id)))
}

/// Forgets a session's audit record. Tokens already handed out stay valid
/// until they expire.
pub async fn revoke_session_tokens(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<RevokeResponse>, Rejection> {
    let registry = state.tokens.registry().ok_or(Rejection::NotFound)?;
    let revoked = registry.revoke_session(&session_id);
    info!("Dropped {} audited tokens for session {}", revoked, session_id);
    Ok(Json(RevokeResponse { revoked }))
}

fn storage_rejection(e: StorageError) -> Rejection {
    match e {
        StorageError::NotFound(_) => Rejection::NotFound,
        other => {
            error!("Security store query failed: {}", other);
            Rejection::Internal
        }
    }
}
