// Request protection for the HTTP surface
pub mod admin;
pub mod context;
pub mod guard;
pub mod rate_limiting;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Boundary rejections. Messages are deliberately generic: they never say
/// which pattern matched or why a token failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    CsrfFailed,
    Unauthorized,
    InvalidInput,
    RateLimited,
    BadRequest,
    NotFound,
    Internal,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::CsrfFailed => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidInput | Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::CsrfFailed => "CSRF_FAILED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::RateLimited => "RATE_LIMITED",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL",
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Self::CsrfFailed => "CSRF validation failed",
            Self::Unauthorized => "Authentication required",
            Self::InvalidInput => "Invalid input detected",
            Self::RateLimited => "Too many requests",
            Self::BadRequest => "Malformed request",
            Self::NotFound => "Not found",
            Self::Internal => "Internal server error",
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorResponse {
                error: self.message().to_string(),
                code: self.code().to_string(),
            }),
        )
            .into_response()
    }
}
