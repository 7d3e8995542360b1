// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Admin-session-protected management surface under
//! `/api/v0/management`: login/logout, project and credential-file
//! CRUD, and cache stats.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_store::{delete_credential, save_credential, CredentialFile, GrokTokenEntry, GrokTokenStore};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::admin::SESSION_COOKIE_NAME;
use crate::state::GatewayState;

const GROK_PROJECT: &str = "grok";
const GROK_SYNTHETIC_FILENAME: &str = "token.json";

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

pub async fn login(State(state): State<GatewayState>, Json(body): Json<LoginRequest>) -> Response {
    let admin = &state.config.admin;
    if body.username != admin.username || !relay_config::verify_admin_password(&state.config, &body.password) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "success": false, "message": "invalid credentials" }))).into_response();
    }

    let session = state.admin_sessions.create();
    let secure = if state.secure_cookies { "; Secure" } else { "" };
    let cookie = format!("{SESSION_COOKIE_NAME}={session}; Path=/; HttpOnly; SameSite=Lax{secure}");

    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "success": true, "message": "logged in" })),
    )
        .into_response()
}

pub async fn logout(State(state): State<GatewayState>, headers: axum::http::HeaderMap) -> Response {
    if let Some(raw) = crate::auth::extract_session_cookie(&headers) {
        state.admin_sessions.revoke(&raw);
    }
    let cleared = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; Max-Age=0");
    (StatusCode::OK, [(header::SET_COOKIE, cleared)], Json(json!({ "success": true }))).into_response()
}

pub async fn check() -> Response {
    Json(json!({ "authenticated": true })).into_response()
}

pub async fn projects_list(State(state): State<GatewayState>) -> Response {
    Json(json!({ "projects": state.config.enabled_projects() })).into_response()
}

#[derive(Deserialize)]
pub struct ProjectQuery {
    project: String,
}

pub async fn tokens_list(State(state): State<GatewayState>, Query(q): Query<ProjectQuery>) -> Response {
    if q.project == GROK_PROJECT {
        return Json(json!({ "tokens": [GROK_SYNTHETIC_FILENAME] })).into_response();
    }
    let files = state.cache.get_token_list(&q.project).await;
    Json(json!({ "tokens": files })).into_response()
}

#[derive(Deserialize)]
pub struct TokenGetQuery {
    project: String,
    filename: String,
}

pub async fn tokens_get(State(state): State<GatewayState>, Query(q): Query<TokenGetQuery>) -> Response {
    if q.project == GROK_PROJECT {
        return match GrokTokenStore::load(&state.accounts_root) {
            Ok(store) => Json(serde_json::to_value(store).unwrap_or(Value::Null)).into_response(),
            Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
        };
    }
    match state.cache.get_token(&q.project, &q.filename).await {
        Some(data) => Json(data).into_response(),
        None => (StatusCode::NOT_FOUND, "token not found").into_response(),
    }
}

#[derive(Deserialize)]
pub struct TokensAddRequest {
    project: String,
    #[serde(rename = "type")]
    kind: String,
    data: Value,
}

pub async fn tokens_add(State(state): State<GatewayState>, Json(body): Json<TokensAddRequest>) -> Response {
    // Grok tokens live in the tiered maps of the single token.json
    // store, not in per-account files.
    if body.project == GROK_PROJECT {
        let Some(sso) = body.data.get("token").and_then(|v| v.as_str()) else {
            return (StatusCode::BAD_REQUEST, "data.token is required for grok tokens").into_response();
        };
        let super_tier = body.kind == "super";
        let mut store = match GrokTokenStore::load(&state.accounts_root) {
            Ok(s) => s,
            Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
        };
        store.insert_entry(super_tier, sso, GrokTokenEntry::new_now());
        if let Err(err) = store.save(&state.accounts_root) {
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
        state.cache.invalidate_project(GROK_PROJECT);
        return Json(json!({ "success": true, "filename": GROK_SYNTHETIC_FILENAME })).into_response();
    }

    let fields = match body.data {
        Value::Object(map) => map,
        _ => return (StatusCode::BAD_REQUEST, "data must be an object").into_response(),
    };
    let file = CredentialFile { kind: body.kind, fields };

    let filename = format!("{}.json", uuid::Uuid::new_v4());
    match save_credential(&state.accounts_root, &state.cache, &body.project, &filename, &file).await {
        Ok(()) => Json(json!({ "success": true, "filename": filename })).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
pub struct TokensDeleteRequest {
    project: String,
    filename: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "type")]
    tier: Option<String>,
}

pub async fn tokens_delete(State(state): State<GatewayState>, Json(body): Json<TokensDeleteRequest>) -> Response {
    if body.project == GROK_PROJECT {
        let Some(sso) = body.token else {
            return (StatusCode::BAD_REQUEST, "token is required for grok deletes").into_response();
        };
        let super_tier = body.tier.as_deref() == Some("super");
        let mut store = match GrokTokenStore::load(&state.accounts_root) {
            Ok(s) => s,
            Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
        };
        let removed = store.delete_entry(super_tier, &sso);
        if removed {
            if let Err(err) = store.save(&state.accounts_root) {
                return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
            }
            state.cache.invalidate_project(GROK_PROJECT);
        }
        return Json(json!({ "success": removed })).into_response();
    }

    match delete_credential(&state.accounts_root, &body.project, &body.filename) {
        Ok(()) => {
            state.cache.invalidate_token(&body.project, &body.filename);
            Json(json!({ "success": true })).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

pub async fn cache_stats(State(state): State<GatewayState>) -> Response {
    Json(state.cache.cache_stats()).into_response()
}
