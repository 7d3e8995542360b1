// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The DeepSeek [`ModelProvider`] implementation: wires credential
//! selection, login, session creation, PoW, and the completion SSE
//! loop together.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use relay_convert::{estimator, MiddleRequest, ResponseEvent};
use relay_store::{CredentialFile, TokenFileCache};
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::deepseek::{self, drain_complete_sse_lines, transform_line, DeepSeekDelta};
use crate::pow;
use crate::provider::{AdapterError, HandleResult, HandleState, ModelProvider, ResponseStream};

const PROJECT: &str = "deepseek";
const DEVICE_ID: &str = "web_proxy_api";
const MOBILE_RE: &str = r"^1[3-9]\d{9}$";

pub struct DeepSeekConfig {
    pub base_url: String,
    pub accounts_root: PathBuf,
    pub pow_wasm_path: PathBuf,
}

impl Default for DeepSeekConfig {
    fn default() -> Self {
        Self {
            base_url: "https://chat.deepseek.com".to_string(),
            accounts_root: PathBuf::from("accounts"),
            pow_wasm_path: PathBuf::from(pow::DEFAULT_POW_WASM_PATH),
        }
    }
}

pub struct DeepSeekProvider {
    client: Client,
    config: DeepSeekConfig,
    cache: Arc<TokenFileCache>,
    selector: Arc<relay_store::CredentialPoolSelector>,
    api_keys: Vec<String>,
}

impl DeepSeekProvider {
    pub fn new(
        config: DeepSeekConfig,
        cache: Arc<TokenFileCache>,
        selector: Arc<relay_store::CredentialPoolSelector>,
        api_keys: Vec<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            config,
            cache,
            selector,
            api_keys,
        }
    }

    /// HTTP client for one credential: direct, or routed through the
    /// credential's own `proxy_url` when the file carries one.
    fn client_for(&self, credential: Option<&serde_json::Value>) -> Result<Client, AdapterError> {
        let proxy_url = credential
            .and_then(|c| c.get("proxy_url"))
            .and_then(|v| v.as_str())
            .and_then(relay_store::normalize_scheme);

        match proxy_url {
            Some(url) => {
                let proxy = reqwest::Proxy::all(&url)
                    .map_err(|e| AdapterError::BadRequest(format!("invalid proxy_url: {e}")))?;
                Client::builder()
                    .proxy(proxy)
                    .build()
                    .map_err(|e| AdapterError::UpstreamFatal(e.to_string()))
            }
            None => Ok(self.client.clone()),
        }
    }

    /// Resolve the bearer token to use upstream: either the caller's
    /// own token (bypassing the pool) or a leased credential's token,
    /// performing login if the credential has none yet.
    ///
    /// Credentials that fail to load or to log in are released and
    /// excluded while the pool is scanned for another candidate; the
    /// loop ends when the pool hands back an already-tried identifier.
    async fn resolve_token(
        &self,
        caller_bearer: &str,
    ) -> Result<(String, Option<String>, Client), AdapterError> {
        if !self.api_keys.iter().any(|k| k == caller_bearer) {
            return Ok((caller_bearer.to_string(), None, self.client.clone()));
        }

        let mut tried = HashSet::new();
        let mut last_err = AdapterError::NoAccount(429);

        loop {
            let credential_id = self
                .selector
                .acquire("deepseek")
                .ok_or(AdapterError::NoAccount(429))?;
            if !tried.insert(credential_id.clone()) {
                self.selector.release(&credential_id);
                return Err(last_err);
            }

            let Some(data) = self.cache.get_token(PROJECT, &credential_id).await else {
                warn!(%credential_id, "credential file missing; trying next");
                self.selector.release(&credential_id);
                last_err = AdapterError::UpstreamFatal("credential file missing".to_string());
                continue;
            };

            let client = match self.client_for(Some(&data)) {
                Ok(c) => c,
                Err(err) => {
                    self.selector.release(&credential_id);
                    return Err(err);
                }
            };

            if let Some(token) = data.get("token").and_then(|t| t.as_str()) {
                return Ok((token.to_string(), Some(credential_id), client));
            }

            match self.login(&client, &data).await {
                Ok(token) => {
                    let mut file: CredentialFile = serde_json::from_value(data)
                        .map_err(|e| AdapterError::UpstreamFatal(e.to_string()))?;
                    file.set_field("token", json!(token));
                    if let Err(err) = relay_store::save_credential(
                        &self.config.accounts_root,
                        &self.cache,
                        PROJECT,
                        &credential_id,
                        &file,
                    )
                    .await
                    {
                        warn!(%err, "failed to persist DeepSeek login token");
                    }
                    return Ok((token, Some(credential_id), client));
                }
                Err(err) => {
                    warn!(%credential_id, %err, "DeepSeek login failed; trying next credential");
                    self.selector.release(&credential_id);
                    last_err = err;
                }
            }
        }
    }

    async fn login(&self, client: &Client, credential: &serde_json::Value) -> Result<String, AdapterError> {
        let email = credential.get("email").and_then(|v| v.as_str());
        let mobile = credential.get("mobile").and_then(|v| v.as_str());
        let password = credential
            .get("password")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::UpstreamFatal("credential has no password".to_string()))?;

        if let Some(m) = mobile {
            let re = regex::Regex::new(MOBILE_RE).unwrap();
            if !re.is_match(m) {
                return Err(AdapterError::BadRequest(format!("invalid mobile number: {m}")));
            }
        }

        let device_id = credential
            .get("device_id")
            .and_then(|v| v.as_str())
            .unwrap_or(DEVICE_ID);

        let mut body = json!({
            "password": password,
            "device_id": device_id,
            "os": "android",
        });
        if let Some(e) = email {
            body["email"] = json!(e);
        } else if let Some(m) = mobile {
            body["mobile"] = json!(m);
        }

        let resp = client
            .post(format!("{}/api/v0/users/login", self.config.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::UpstreamTransient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AdapterError::UpstreamFatal(format!("login failed: {}", resp.status())));
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::UpstreamFatal(e.to_string()))?;

        value["data"]["biz_data"]["user"]["token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AdapterError::UpstreamFatal("login response missing token".to_string()))
    }

    async fn create_session(&self, client: &Client, token: &str) -> Result<String, AdapterError> {
        for attempt in 0..3 {
            let resp = client
                .post(format!("{}/api/v0/chat_session/create", self.config.base_url))
                .bearer_auth(token)
                .json(&json!({ "agent": "chat" }))
                .send()
                .await
                .map_err(|e| AdapterError::UpstreamTransient(e.to_string()))?;

            let value: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| AdapterError::UpstreamTransient(e.to_string()))?;

            if value["code"].as_i64() == Some(0) {
                return value["data"]["biz_data"]["id"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| AdapterError::UpstreamFatal("session response missing id".to_string()));
            }
            warn!(attempt, "chat_session/create returned non-zero code, retrying");
        }
        Err(AdapterError::UpstreamFatal("could not create chat session after 3 attempts".to_string()))
    }

    async fn solve_pow(&self, client: &Client, token: &str) -> Result<String, AdapterError> {
        let resp = client
            .post(format!("{}/api/v0/chat/create_pow_challenge", self.config.base_url))
            .bearer_auth(token)
            .json(&json!({ "target_path": "/api/v0/chat/completion" }))
            .send()
            .await
            .map_err(|e| AdapterError::UpstreamTransient(e.to_string()))?;

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::UpstreamTransient(e.to_string()))?;

        let data = &value["data"]["biz_data"]["challenge"];
        let algorithm = data["algorithm"].as_str().unwrap_or_default();
        if algorithm != "DeepSeekHashV1" {
            return Err(AdapterError::PowFailure(format!("unsupported PoW algorithm '{algorithm}'")));
        }

        let challenge = data["challenge"].as_str().unwrap_or_default().to_string();
        let salt = data["salt"].as_str().unwrap_or_default().to_string();
        let difficulty = data["difficulty"].as_u64().unwrap_or(pow::FALLBACK_DIFFICULTY);
        let expire_at = data["expire_at"].as_i64().unwrap_or(pow::FALLBACK_EXPIRE_AT);
        let signature = data["signature"].as_str().unwrap_or_default().to_string();
        let target_path = data["target_path"].as_str().unwrap_or("/api/v0/chat/completion").to_string();

        if data["difficulty"].is_null() || data["expire_at"].is_null() {
            warn!("PoW challenge missing difficulty/expire_at; using stale fallback constants");
        }

        let solution = pow::solve(&self.config.pow_wasm_path, &challenge, &salt, expire_at, difficulty)
            .map_err(|e| AdapterError::PowFailure(e.to_string()))?;

        let payload = json!({
            "algorithm": algorithm,
            "challenge": challenge,
            "salt": salt,
            "answer": solution.answer,
            "signature": signature,
            "target_path": target_path,
        });

        Ok(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            payload.to_string(),
        ))
    }
}

#[async_trait]
impl ModelProvider for DeepSeekProvider {
    fn name(&self) -> &str {
        "deepseek"
    }

    fn models(&self) -> Vec<String> {
        vec![
            "deepseek-chat".to_string(),
            "deepseek-reasoner".to_string(),
            "deepseek-chat-search".to_string(),
            "deepseek-reasoner-search".to_string(),
        ]
    }

    async fn handle(
        &self,
        request: MiddleRequest,
        caller_bearer: &str,
    ) -> Result<HandleResult, AdapterError> {
        let flags = deepseek::flags_for_model(&request.model);
        let prompt = deepseek::prepare_prompt(&request.messages);

        let (token, credential_id, client) = self.resolve_token(caller_bearer).await?;

        let skip = |id: &Option<String>| {
            if let Some(id) = id {
                self.selector.skip("deepseek", id, None);
            }
        };
        let release = |id: &Option<String>| {
            if let Some(id) = id {
                self.selector.release(id);
            }
        };

        let session_id = match self.create_session(&client, &token).await {
            Ok(id) => id,
            Err(err) => {
                skip(&credential_id);
                release(&credential_id);
                return Err(err);
            }
        };

        let pow_header = match self.solve_pow(&client, &token).await {
            Ok(h) => h,
            Err(err) => {
                // PoW failure does not mark the credential bad.
                release(&credential_id);
                return Err(err);
            }
        };

        let body = json!({
            "chat_session_id": session_id,
            "parent_message_id": serde_json::Value::Null,
            "prompt": prompt,
            "ref_file_ids": [],
            "thinking_enabled": flags.thinking_enabled,
            "search_enabled": flags.search_enabled,
        });

        let resp = client
            .post(format!("{}/api/v0/chat/completion", self.config.base_url))
            .bearer_auth(&token)
            .header("x-ds-pow-response", pow_header)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                skip(&credential_id);
                release(&credential_id);
                AdapterError::UpstreamTransient(e.to_string())
            })?;

        if !resp.status().is_success() {
            skip(&credential_id);
            release(&credential_id);
            return Err(AdapterError::UpstreamFatal(format!(
                "completion request failed: {}",
                resp.status()
            )));
        }

        if let Some(id) = &credential_id {
            self.selector.clear_skip("deepseek", id);
        }

        let prompt_tokens = estimator::estimate_text(&prompt);
        let byte_stream = resp.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut buffer = String::new();
            let mut accumulated = String::new();
            let mut reasoning = String::new();
            let mut role_emitted = false;
            futures::pin_mut!(byte_stream);

            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.map_err(|e| anyhow::anyhow!(e))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                for line in drain_complete_sse_lines(&mut buffer) {
                    match transform_line(&line, flags)? {
                        DeepSeekDelta::Content(text) => {
                            accumulated.push_str(&text);
                            if !role_emitted {
                                role_emitted = true;
                                yield ResponseEvent::RoleAssistant;
                            }
                            yield ResponseEvent::ContentDelta(text);
                        }
                        DeepSeekDelta::Reasoning(text) => {
                            reasoning.push_str(&text);
                            if !role_emitted {
                                role_emitted = true;
                                yield ResponseEvent::RoleAssistant;
                            }
                            yield ResponseEvent::ReasoningDelta(text);
                        }
                        DeepSeekDelta::Finished => {
                            let completion_tokens = estimator::estimate_text(&format!("{accumulated}{reasoning}"));
                            yield ResponseEvent::Done {
                                finish_reason: "stop".to_string(),
                                usage: Some(relay_convert::Usage::new(prompt_tokens, completion_tokens)),
                            };
                        }
                        DeepSeekDelta::Ignored => {}
                    }
                }
            }
        };

        Ok(HandleResult {
            stream: Box::pin(stream) as ResponseStream,
            state: HandleState {
                credential_id,
                model_id: request.model,
            },
            session_id: Some(session_id),
        })
    }

    async fn release(&self, state: HandleState) {
        if let Some(id) = state.credential_id {
            self.selector.release(&id);
        }
        info!(model = %state.model_id, "released DeepSeek credential");
    }
}
