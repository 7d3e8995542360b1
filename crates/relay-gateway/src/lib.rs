// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Axum HTTP surface: the public `/v1` chat APIs, the admin-session
//! `/api/v0/management` surface, and cached-media delivery.

pub mod admin;
pub mod auth;
pub mod dispatcher;
pub mod ingress;
pub mod management;
pub mod media;
pub mod security;
pub mod state;

use std::net::SocketAddr;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

pub use state::GatewayState;

/// Build the full router: public `/v1*` routes behind bearer auth,
/// `/api/v0/management/*` behind the admin session cookie (login and
/// logout excepted), and `/images/*` media delivery open to anyone
/// holding a cached file's flattened path.
pub fn router(state: GatewayState) -> Router {
    let public = Router::new()
        .route("/v1/chat/completions", post(ingress::chat_completions))
        .route("/v1/messages", post(ingress::messages))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::bearer_auth_mw));

    let gemini = Router::new().route("/v1beta/models/:model_action", post(ingress::generate_content));

    let models = Router::new().route("/v1/models", get(ingress::list_models));

    let management_open = Router::new()
        .route("/api/v0/management/login", post(management::login))
        .route("/api/v0/management/logout", post(management::logout));

    let management_protected = Router::new()
        .route("/api/v0/management/check", get(management::check))
        .route("/api/v0/management/projects/list", get(management::projects_list))
        .route("/api/v0/management/tokens/list", get(management::tokens_list))
        .route("/api/v0/management/tokens/get", get(management::tokens_get))
        .route("/api/v0/management/tokens/add", post(management::tokens_add))
        .route("/api/v0/management/tokens/delete", post(management::tokens_delete))
        .route("/api/v0/management/cache/stats", get(management::cache_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::admin_auth_mw));

    let media = Router::new().route("/images/:kind/:flat_path", get(media::serve_media));

    Router::new()
        .merge(public)
        .merge(gemini)
        .merge(models)
        .merge(management_open)
        .merge(management_protected)
        .merge(media)
        .layer(middleware::from_fn(security::security_headers))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve forever.
pub async fn serve(state: GatewayState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    info!(%addr, "relay gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use relay_config::Config;
    use relay_providers::{MediaCache, ModelRegistry};
    use relay_store::{CredentialPoolSelector, TokenFileCache};
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_addr() -> ConnectInfo<SocketAddr> {
        ConnectInfo(([203, 0, 113, 5], 12345).into())
    }

    fn test_state(dir: &std::path::Path) -> GatewayState {
        GatewayState {
            config: Arc::new(Config {
                admin: Default::default(),
                keys: vec!["secret-key".into()],
                projects: Default::default(),
                grok: Default::default(),
            }),
            cache: TokenFileCache::new(dir.join("accounts")),
            selector: Arc::new(CredentialPoolSelector::new()),
            registry: Arc::new(ModelRegistry::new()),
            providers: Arc::new(HashMap::new()),
            accounts_root: dir.join("accounts"),
            media_images: Arc::new(MediaCache::new(dir.join("images"), 64)),
            media_videos: Arc::new(MediaCache::new(dir.join("videos"), 64)),
            admin_sessions: Arc::new(admin::AdminSessions::new()),
            secure_cookies: false,
            failure_limiter: Arc::new(security::FailureLimiter::new(120, 10)),
        }
    }

    #[tokio::test]
    async fn chat_completions_rejects_missing_bearer() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .extension(test_addr())
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn chat_completions_rejects_unknown_model_with_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let body = serde_json::json!({ "model": "not-a-real-model", "messages": [{"role": "user", "content": "hi"}] });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("authorization", "Bearer secret-key")
                    .header("content-type", "application/json")
                    .extension(test_addr())
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn management_routes_require_admin_session() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v0/management/check")
                    .extension(test_addr())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
