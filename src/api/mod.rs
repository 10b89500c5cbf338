pub mod auth;
pub mod error;
mod handlers;
pub mod ticket;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::session::SessionManager;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    /// Single-use tickets for authenticating WebSocket upgrades.
    pub tickets: Arc<ticket::TicketStore>,
}

impl AppState {
    pub fn new(sessions: SessionManager) -> Self {
        Self {
            sessions,
            tickets: Arc::new(ticket::TicketStore::new()),
        }
    }
}

/// Configuration for the HTTP/WS router.
///
/// Controls authentication, CORS, rate limiting, and origin checks.
/// Use `RouterConfig::default()` in tests for a minimal no-auth setup.
pub struct RouterConfig {
    pub token: Option<String>,
    pub bind: SocketAddr,
    pub cors_origins: Vec<String>,
    pub rate_limit: Option<u32>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            token: None,
            bind: SocketAddr::from(([127, 0, 0, 1], 7681)),
            cors_origins: vec![],
            rate_limit: None,
        }
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let session_routes = Router::new()
        .route("/jobs", get(job_list).post(job_submit))
        .route("/jobs/{job}", get(job_status))
        .route("/jobs/{job}/cancel", post(job_cancel))
        .route("/history", get(history))
        .route("/input", post(input))
        .route("/ws", get(ws_stream));

    let tickets = state.tickets.clone();
    let protected = Router::new()
        .route("/auth/ws-ticket", post(ws_ticket))
        .route("/sessions", get(session_list).post(session_create))
        .route("/sessions/{id}", get(session_get).delete(session_close))
        .nest("/sessions/{id}", session_routes)
        .with_state(state.clone());

    // Apply rate limiting to the protected routes if configured.
    let protected = match config.rate_limit {
        Some(rps) => {
            use tower_governor::{
                governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
            };
            let governor_conf = GovernorConfigBuilder::default()
                .per_second(u64::from(rps))
                .burst_size(rps)
                .key_extractor(PeerIpKeyExtractor)
                .finish();
            match governor_conf {
                Some(conf) => protected.layer(GovernorLayer::new(Arc::new(conf))),
                None => {
                    tracing::warn!(rate_limit = rps, "invalid rate limit, not limiting");
                    protected
                }
            }
        }
        None => protected,
    };

    let protected = match config.token {
        Some(token) => protected.layer(axum::middleware::from_fn(move |req, next| {
            let t = token.clone();
            let s = tickets.clone();
            async move { auth::require_auth(t, s, req, next).await }
        })),
        None => {
            // Without a token the server is loopback-only, but a web page in
            // the user's browser can still reach it. Only same-host origins
            // and configured CORS origins may drive the shell.
            let port = config.bind.port();
            let mut allowed_origins = vec![
                format!("http://127.0.0.1:{}", port),
                format!("http://localhost:{}", port),
                format!("http://[::1]:{}", port),
            ];
            allowed_origins.extend(config.cors_origins.iter().cloned());
            protected.layer(axum::middleware::from_fn(move |req, next| {
                let origins = allowed_origins.clone();
                auth::check_origin(origins, req, next)
            }))
        }
    };

    let router = Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(protected)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
        ))
        .layer(TraceLayer::new_for_http());

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}
