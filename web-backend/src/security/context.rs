use axum::{
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap},
};
use axum_extra::extract::cookie::CookieJar;
use guardrail_core::RequestContext;
use std::net::SocketAddr;

pub const SESSION_COOKIE: &str = "session_id";

/// Ambient request data for security events. The client address is the
/// socket peer unless `trust_proxy_headers` is set, in which case
/// `X-Forwarded-For` and `X-Real-IP` win.
pub fn request_context(request: &Request, trust_proxy_headers: bool) -> RequestContext {
    let headers = request.headers();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let forwarded = if trust_proxy_headers { client_ip(headers) } else { None };

    RequestContext {
        ip_address: forwarded.or(peer),
        user_agent: header_str(headers, header::USER_AGENT.as_str()),
        endpoint: Some(request.uri().path().to_string()),
        method: Some(request.method().to_string()),
    }
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded_for) = header_str(headers, "x-forwarded-for") {
        if let Some(first_ip) = forwarded_for.split(',').next() {
            let first_ip = first_ip.trim();
            if !first_ip.is_empty() {
                return Some(first_ip.to_string());
            }
        }
    }

    header_str(headers, "x-real-ip")
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn session_id(headers: &HeaderMap) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}
