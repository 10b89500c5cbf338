use std::sync::Arc;

use axum::{extract::Request, middleware::Next, response::Response};
use subtle::ConstantTimeEq;

use super::error::ApiError;
use super::ticket::TicketStore;

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Extract a `?ticket=` value from the query string.
fn extract_ticket(req: &Request) -> Option<String> {
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("ticket=").map(|v| v.to_string()))
    })
}

/// Check if this request is a WebSocket upgrade.
fn is_ws_upgrade(req: &Request) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn token_matches(given: &str, expected: &str) -> bool {
    given.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Auth middleware function.
///
/// Authentication flow:
/// 1. Try Bearer token from Authorization header
/// 2. If missing AND the request is a WebSocket upgrade, redeem the
///    `?ticket=` query param against the ticket store. The token itself is
///    never accepted in a URL.
/// 3. Otherwise reject
pub async fn require_auth(
    expected_token: String,
    tickets: Arc<TicketStore>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(ref token) = extract_bearer(&req) {
        if token_matches(token, &expected_token) {
            return Ok(next.run(req).await);
        }
        return Err(ApiError::AuthInvalid);
    }

    if is_ws_upgrade(&req) {
        if let Some(ticket) = extract_ticket(&req) {
            if tickets.redeem(&ticket) {
                return Ok(next.run(req).await);
            }
            tracing::debug!("rejected websocket upgrade with unknown or expired ticket");
        }
    }

    Err(ApiError::AuthRequired)
}

/// Reject browser requests from origins not on the allowed list.
///
/// Used when the server runs without a token: any web page could otherwise
/// submit jobs or open a stream against a localhost server. Requests
/// without an `Origin` header (curl, agents) are not browser-initiated and
/// pass through.
pub async fn check_origin(allowed_origins: Vec<String>, req: Request, next: Next) -> Result<Response, ApiError> {
    let origin = match req.headers().get("origin").and_then(|v| v.to_str().ok()) {
        None => return Ok(next.run(req).await),
        Some(o) => o,
    };
    if allowed_origins.iter().any(|allowed| allowed == origin) {
        return Ok(next.run(req).await);
    }
    tracing::warn!(origin, ws = is_ws_upgrade(&req), "rejected cross-origin request");
    Err(ApiError::OriginNotAllowed)
}
