mod handlers;
mod security;
#[cfg(feature = "database")]
mod sqlite_store;
mod state;

use axum::{
    http::{header, HeaderName, Method},
    middleware,
    routing::{get, post},
    Router,
};
use guardrail_core::SecurityConfig;
use state::AppState;
use std::net::SocketAddr;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    sensitive_headers::SetSensitiveRequestHeadersLayer,
    trace::TraceLayer,
};
use tracing::{info, Level};

use security::{admin::require_admin, guard::request_guard, rate_limiting::rate_limit_middleware};

pub(crate) fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-csrf-token"),
            HeaderName::from_static("x-csrftoken"),
        ])
        .max_age(Duration::from_secs(300));

    let review = Router::new()
        .route("/events", get(handlers::list_events))
        .route("/alerts", get(handlers::list_alerts))
        .route("/alerts/:id/resolve", post(handlers::resolve_alert))
        .route(
            "/sessions/:session_id/tokens",
            get(handlers::session_tokens).delete(handlers::revoke_session_tokens),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/api/csrf-token", get(handlers::csrf_token))
        .route("/api/assessments", post(handlers::submit_assessment))
        .nest("/api/security", review)
        .route("/health", get(handlers::health_check))
        // Guard runs inside the rate limiter
        .layer(middleware::from_fn_with_state(state.clone(), request_guard))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(SetSensitiveRequestHeadersLayer::new([
                    header::COOKIE,
                    header::AUTHORIZATION,
                    HeaderName::from_static("x-csrf-token"),
                    HeaderName::from_static("x-csrftoken"),
                ]))
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SecurityConfig::load()?;

    let level = config.server.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let state = AppState::new(&config).await?;
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("{} security service listening on http://{}", config.app_name, addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
