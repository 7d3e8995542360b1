// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bearer-key auth for `/v1/*` and admin-session-cookie auth for the
//! management surface.
//!
//! Key comparison uses [`subtle::ConstantTimeEq`] so a caller probing
//! with near-miss keys learns nothing from response timing.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::admin::SESSION_COOKIE_NAME;
use crate::state::GatewayState;

/// Extension inserted on a request once its caller bearer has been
/// validated, so downstream handlers (and ultimately
/// `ModelProvider::handle`) can see which key was used.
#[derive(Clone)]
pub struct CallerBearer(pub String);

/// Constant-time membership test against the configured caller keys.
pub fn valid_caller_key(config: &relay_config::Config, provided: &str) -> bool {
    use subtle::ConstantTimeEq;
    config
        .keys
        .iter()
        .any(|k| bool::from(k.as_bytes().ct_eq(provided.as_bytes())))
}

pub async fn bearer_auth_mw(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request,
    next: Next,
) -> Response {
    match extract_bearer(req.headers()).map(|t| t.to_string()) {
        Some(token) if valid_caller_key(&state.config, &token) => {
            req.extensions_mut().insert(CallerBearer(token));
            next.run(req).await
        }
        _ => {
            warn!(ip = %addr.ip(), "caller auth failed on /v1 route");
            if !state.failure_limiter.record_failure(addr.ip()) {
                return too_many_requests();
            }
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(axum::http::header::RETRY_AFTER, "60")],
        "Too Many Requests",
    )
        .into_response()
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ")
}

pub async fn admin_auth_mw(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    match extract_session_cookie(req.headers()) {
        Some(raw) if state.admin_sessions.verify(&raw) => next.run(req).await,
        _ => {
            if !state.failure_limiter.record_failure(addr.ip()) {
                return too_many_requests();
            }
            (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

pub fn extract_session_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let pair = pair.trim();
        let (name, value) = pair.split_once('=')?;
        (name == SESSION_COOKIE_NAME).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut m = HeaderMap::new();
        for (k, v) in pairs {
            m.insert(
                axum::http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        m
    }

    #[test]
    fn extract_bearer_from_valid_header() {
        let h = headers_with(&[("authorization", "Bearer abc123")]);
        assert_eq!(extract_bearer(&h), Some("abc123"));
    }

    #[test]
    fn extract_bearer_missing_header() {
        assert!(extract_bearer(&HeaderMap::new()).is_none());
    }

    #[test]
    fn extract_bearer_wrong_scheme() {
        let h = headers_with(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert!(extract_bearer(&h).is_none());
    }

    #[test]
    fn extract_session_cookie_among_several() {
        let h = headers_with(&[("cookie", "foo=bar; relay_session=xyz; baz=qux")]);
        assert_eq!(extract_session_cookie(&h).as_deref(), Some("xyz"));
    }

    #[test]
    fn extract_session_cookie_absent() {
        let h = headers_with(&[("cookie", "foo=bar")]);
        assert!(extract_session_cookie(&h).is_none());
    }

    #[test]
    fn valid_caller_key_matches_exactly() {
        let config = relay_config::Config {
            admin: Default::default(),
            keys: vec!["k1".into(), "k2".into()],
            projects: Default::default(),
            grok: Default::default(),
        };
        assert!(valid_caller_key(&config, "k2"));
        assert!(!valid_caller_key(&config, "k"));
        assert!(!valid_caller_key(&config, "k22"));
    }
}
