// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The three public ingress shapes: OpenAI, Anthropic, and Gemini.
//! Each handler converts its wire body into a [`MiddleRequest`] and
//! hands off to [`dispatch`]; HTTP mapping and auth are the only
//! things that differ between them.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Extension, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_convert::{anthropic, gemini, openai};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::CallerBearer;
use crate::dispatcher::{self, bad_request, dispatch, resolve_provider, IngressKind};
use crate::state::GatewayState;

pub async fn chat_completions(
    State(state): State<GatewayState>,
    Extension(CallerBearer(bearer)): Extension<CallerBearer>,
    Json(body): Json<Value>,
) -> Response {
    let request = match openai::to_middle(&body) {
        Ok(r) => r,
        Err(err) => return bad_request(IngressKind::OpenAi, err.to_string()),
    };
    let provider = match resolve_provider(&state, &request.model) {
        Ok(p) => p,
        Err(err) => return dispatcher::adapter_error_response(IngressKind::OpenAi, &err),
    };
    dispatch(provider, request, &bearer, IngressKind::OpenAi).await
}

pub async fn messages(
    State(state): State<GatewayState>,
    Extension(CallerBearer(bearer)): Extension<CallerBearer>,
    Json(body): Json<Value>,
) -> Response {
    let request = match anthropic::to_middle(&body) {
        Ok(r) => r,
        Err(err) => return bad_request(IngressKind::Anthropic, err.to_string()),
    };
    let provider = match resolve_provider(&state, &request.model) {
        Ok(p) => p,
        Err(err) => return dispatcher::adapter_error_response(IngressKind::Anthropic, &err),
    };
    dispatch(provider, request, &bearer, IngressKind::Anthropic).await
}

pub async fn list_models() -> Response {
    Json(json!({ "object": "list", "data": relay_providers::static_catalog() })).into_response()
}

#[derive(Deserialize)]
pub struct GeminiKeyQuery {
    key: Option<String>,
}

/// Gemini accepts its key over `?key=`, `x-goog-api-key`, `x-api-key`,
/// or a plain `Authorization: Bearer`, unlike the other two ingress
/// points which take only a bearer header.
fn extract_gemini_key(headers: &HeaderMap, query: &GeminiKeyQuery) -> Option<String> {
    if let Some(key) = &query.key {
        return Some(key.clone());
    }
    if let Some(v) = headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    if let Some(v) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    crate::auth::extract_bearer(headers).map(|s| s.to_string())
}

/// Path segment is `{model}:generateContent` or
/// `{model}:streamGenerateContent`, axum has no native `:`-suffix
/// matcher so the handler splits it itself.
pub async fn generate_content(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Query(query): Query<GeminiKeyQuery>,
    Json(body): Json<Value>,
) -> Response {
    let Some((model, action)) = model_action.rsplit_once(':') else {
        return bad_request(IngressKind::GeminiNonStream, "missing ':action' suffix");
    };

    let force_stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => return bad_request(IngressKind::GeminiNonStream, format!("unsupported action '{other}'")),
    };
    let kind = if force_stream { IngressKind::GeminiStream } else { IngressKind::GeminiNonStream };

    let key = extract_gemini_key(&headers, &query).filter(|k| crate::auth::valid_caller_key(&state.config, k));
    let Some(key) = key else {
        if !state.failure_limiter.record_failure(addr.ip()) {
            return (
                axum::http::StatusCode::TOO_MANY_REQUESTS,
                [(axum::http::header::RETRY_AFTER, "60")],
                "Too Many Requests",
            )
                .into_response();
        }
        return dispatcher::adapter_error_response(kind, &relay_providers::AdapterError::CallerAuth);
    };

    let request = match gemini::to_middle(model, &body, force_stream) {
        Ok(r) => r,
        Err(err) => return bad_request(kind, err.to_string()),
    };
    let provider = match resolve_provider(&state, &request.model) {
        Ok(p) => p,
        Err(err) => return dispatcher::adapter_error_response(kind, &err),
    };
    dispatch(provider, request, &key, kind).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_gemini_key_prefers_query() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", "header-key".parse().unwrap());
        let query = GeminiKeyQuery { key: Some("query-key".to_string()) };
        assert_eq!(extract_gemini_key(&headers, &query).as_deref(), Some("query-key"));
    }

    #[test]
    fn extract_gemini_key_falls_back_to_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer from-bearer".parse().unwrap());
        let query = GeminiKeyQuery { key: None };
        assert_eq!(extract_gemini_key(&headers, &query).as_deref(), Some("from-bearer"));
    }

    #[test]
    fn extract_gemini_key_none_when_absent() {
        let query = GeminiKeyQuery { key: None };
        assert!(extract_gemini_key(&HeaderMap::new(), &query).is_none());
    }
}
