// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Dispatcher-level tests over the full router with a scripted mock
/// provider: SSE ordering, aggregation, ingress rewraps, and the
/// release-exactly-once lease discipline.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use relay_convert::{ResponseEvent, Usage};
use relay_gateway::{admin::AdminSessions, security::FailureLimiter, GatewayState};
use relay_providers::{MediaCache, ModelProvider, ModelRegistry, ScriptedProvider};
use relay_store::{CredentialPoolSelector, TokenFileCache};
use tower::ServiceExt;

fn test_addr() -> ConnectInfo<SocketAddr> {
    ConnectInfo(([203, 0, 113, 9], 50000).into())
}

/// State with a single scripted provider owning `mock-model`.
fn scripted_state(dir: &std::path::Path, scripts: Vec<Vec<ResponseEvent>>) -> (GatewayState, Arc<ScriptedProvider>) {
    let provider = Arc::new(ScriptedProvider::new(
        "mock",
        vec!["mock-model".to_string()],
        scripts,
    ));

    let registry = Arc::new(ModelRegistry::new());
    registry.register("mock-model", "mock");

    let mut providers: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
    providers.insert("mock".to_string(), provider.clone());

    let state = GatewayState {
        config: Arc::new(relay_config::Config {
            admin: Default::default(),
            keys: vec!["k1".into()],
            projects: Default::default(),
            grok: Default::default(),
        }),
        cache: TokenFileCache::new(dir.join("accounts")),
        selector: Arc::new(CredentialPoolSelector::new()),
        registry,
        providers: Arc::new(providers),
        accounts_root: dir.join("accounts"),
        media_images: Arc::new(MediaCache::new(dir.join("media/image"), 64)),
        media_videos: Arc::new(MediaCache::new(dir.join("media/video"), 64)),
        admin_sessions: Arc::new(AdminSessions::new()),
        secure_cookies: false,
        failure_limiter: Arc::new(FailureLimiter::new(120, 10)),
    };
    (state, provider)
}

fn hello_script() -> Vec<ResponseEvent> {
    vec![
        ResponseEvent::ReasoningDelta("let me think".to_string()),
        ResponseEvent::ContentDelta("Hel".to_string()),
        ResponseEvent::ContentDelta("lo".to_string()),
        ResponseEvent::Done {
            finish_reason: "stop".to_string(),
            usage: Some(Usage::new(1, 2)),
        },
    ]
}

fn openai_request(stream: bool) -> Request<Body> {
    let body = serde_json::json!({
        "model": "mock-model",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream,
    });
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", "Bearer k1")
        .extension(test_addr())
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn streamed_sse_announces_role_once_then_finishes_with_done() {
    let dir = tempfile::tempdir().unwrap();
    let (state, provider) = scripted_state(dir.path(), vec![hello_script()]);
    let app = relay_gateway::router(state);

    let response = app.oneshot(openai_request(true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    assert_eq!(text.matches("\"role\":\"assistant\"").count(), 1);
    let role_pos = text.find("\"role\":\"assistant\"").unwrap();
    let first_content = text.find("\"content\"").unwrap();
    assert!(role_pos <= first_content, "role must precede any content");

    let finish_pos = text.find("\"finish_reason\":\"stop\"").unwrap();
    let done_pos = text.rfind("data: [DONE]\n\n").unwrap();
    assert!(finish_pos < done_pos, "[DONE] must follow the final chunk");
    assert!(text.ends_with("data: [DONE]\n\n"));

    assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn aggregation_concatenates_deltas_in_stream_order() {
    let dir = tempfile::tempdir().unwrap();
    let (state, provider) = scripted_state(dir.path(), vec![hello_script()]);
    let app = relay_gateway::router(state);

    let response = app.oneshot(openai_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(body["choices"][0]["message"]["reasoning_content"], "let me think");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 1);
    assert_eq!(body["usage"]["completion_tokens"], 2);

    assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gemini_stream_rewraps_chunks_without_done_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _provider) = scripted_state(dir.path(), vec![hello_script()]);
    let app = relay_gateway::router(state);

    let body = serde_json::json!({
        "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1beta/models/mock-model:streamGenerateContent?key=k1")
                .header("content-type", "application/json")
                .extension(test_addr())
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    assert!(text.contains("\"candidates\""));
    assert!(text.contains("\"modelVersion\":\"mock-model\""));
    assert!(!text.contains("data: [DONE]"), "Gemini streams end on close, not a sentinel");
}

#[tokio::test]
async fn gemini_non_stream_converts_to_candidates_shape() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _provider) = scripted_state(dir.path(), vec![hello_script()]);
    let app = relay_gateway::router(state);

    let body = serde_json::json!({
        "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1beta/models/mock-model:generateContent")
                .header("content-type", "application/json")
                .header("x-goog-api-key", "k1")
                .extension(test_addr())
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "Hello");
    assert_eq!(body["candidates"][0]["finishReason"], "STOP");
    assert_eq!(body["usageMetadata"]["totalTokenCount"], 3);
}

#[tokio::test]
async fn anthropic_non_stream_converts_to_message_shape() {
    let dir = tempfile::tempdir().unwrap();
    let (state, _provider) = scripted_state(dir.path(), vec![hello_script()]);
    let app = relay_gateway::router(state);

    let body = serde_json::json!({
        "model": "mock-model",
        "messages": [{"role": "user", "content": "hi"}],
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header("content-type", "application/json")
                .header("authorization", "Bearer k1")
                .extension(test_addr())
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["text"], "Hello");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 1);
    assert_eq!(body["usage"]["output_tokens"], 2);
}

#[tokio::test]
async fn exhausted_scripts_surface_no_account_as_service_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let (state, provider) = scripted_state(dir.path(), vec![]);
    let app = relay_gateway::router(state);

    let response = app.oneshot(openai_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // handle() failed before any lease was handed out, so nothing to
    // release.
    assert_eq!(provider.releases.load(Ordering::SeqCst), 0);
}
