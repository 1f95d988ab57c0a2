use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    extract::State,
    http::{header::AUTHORIZATION, header::RETRY_AFTER, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{allowance::Identity, auth::extract_bearer_token, state::AppState};

pub const GUEST_ID_HEADER: &str = "x-guest-id";

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

/// Resolves the caller to a user (valid bearer token) or a guest device.
///
/// A present but invalid token is rejected rather than downgraded to guest.
/// Guests without a usable `X-Guest-Id` get a fresh one echoed back.
pub async fn resolve_identity(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    if let Some(auth_header) = auth_header {
        let claims = match state.auth.verify_bearer_token(&auth_header).await {
            Ok(claims) => claims,
            Err(error) => {
                tracing::warn!(error = %error, "authorization failed");
                return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
            }
        };
        request.extensions_mut().insert(Identity::User(claims.sub));
        return next.run(request).await;
    }

    let socket_addr = socket_addr(&request);
    let key = client_identity(request.headers(), socket_addr, state.config.trust_proxy);
    if let Err(retry_after) = state.guest_limiter.check(&key) {
        return too_many_requests(retry_after.as_secs());
    }

    let presented = request
        .headers()
        .get(GUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 64)
        .map(str::to_string);
    let issued = presented.is_none();
    let device = presented.unwrap_or_else(|| Uuid::new_v4().to_string());

    request
        .extensions_mut()
        .insert(Identity::Guest(device.clone()));
    let mut response = next.run(request).await;

    if issued {
        if let Ok(value) = HeaderValue::from_str(&device) {
            response.headers_mut().insert(GUEST_ID_HEADER, value);
        }
    }
    response
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value,
        None => return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
    };

    let claims = match state.auth.verify_bearer_token(auth_header).await {
        Ok(claims) => claims,
        Err(error) => {
            tracing::warn!(error = %error, "authorization failed");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    request.extensions_mut().insert(AuthenticatedUser {
        user_id: claims.sub,
    });

    next.run(request).await
}

pub async fn require_admin(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let expected = match state.config.admin_api_token.as_deref() {
        Some(token) => token,
        None => return (StatusCode::NOT_FOUND, "Not Found").into_response(),
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| extract_bearer_token(value).ok());

    let authorized = presented
        .map(|token| bool::from(token.as_bytes().ct_eq(expected.as_bytes())))
        .unwrap_or(false);

    if !authorized {
        tracing::warn!("rejected admin request with missing or wrong token");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    next.run(request).await
}

pub async fn api_rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let socket_addr = socket_addr(&request);
    let key = client_identity(request.headers(), socket_addr, state.config.trust_proxy);

    if let Err(retry_after) = state.api_limiter.check(&key) {
        return too_many_requests(retry_after.as_secs());
    }

    next.run(request).await
}

fn too_many_requests(retry_after_secs: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        "Too many requests from this IP, please try again later",
    )
        .into_response();
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs.max(1)));
    response
}

fn socket_addr(request: &Request<Body>) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<SocketAddr>()
        .copied()
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|value| value.0)
        })
}

fn client_identity(
    headers: &HeaderMap,
    socket_addr: Option<SocketAddr>,
    trust_proxy: bool,
) -> String {
    if trust_proxy {
        if let Some(value) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            if let Some(first) = value.split(',').next() {
                let candidate = first.trim();
                if !candidate.is_empty() {
                    return candidate.to_string();
                }
            }
        }

        if let Some(value) = headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
        {
            let candidate = value.trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }

    socket_addr
        .map(|address| address.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_is_only_trusted_behind_a_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        let peer: SocketAddr = "10.0.0.1:4000".parse().unwrap();

        assert_eq!(client_identity(&headers, Some(peer), true), "203.0.113.9");
        assert_eq!(client_identity(&headers, Some(peer), false), "10.0.0.1");
        assert_eq!(client_identity(&HeaderMap::new(), None, true), "unknown");
    }
}
