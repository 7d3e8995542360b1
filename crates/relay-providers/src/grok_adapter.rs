// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Grok [`ModelProvider`] implementation: quota-ranked token
//! selection, Statsig/xai headers, the shared retry policy, proxied
//! egress, media-backed image/video delivery, and the background quota
//! refresher.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use relay_config::GrokConfig;
use relay_convert::{estimator, MiddleRequest, Role, ToolCall};
use relay_store::{CredentialPoolSelector, GrokTokenEntry, GrokTokenStore, ProxyPool};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::grok::{self, GrokChunk};
use crate::media_cache::MediaCache;
use crate::provider::{AdapterError, HandleResult, HandleState, ModelProvider, ResponseStream};

const ASSETS_BASE: &str = "https://assets.grok.com";
const COMPLETION_PATH: &str = "/rest/app-chat/conversations/new";
const RATE_LIMITS_PATH: &str = "/rest/rate-limits";
const UPLOAD_PATH: &str = "/rest/app-chat/upload-file";
const CREATE_POST_PATH: &str = "/rest/app-chat/create-post";

const IMAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const VIDEO_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of [`GrokProvider::send_with_retries`] when no 2xx was
/// obtained. Keeps the upstream status around so the caller can decide
/// whether the failure should count toward token expiry (4xx only).
#[derive(Debug)]
enum SendError {
    Transport(String),
    Status(u16),
    Exhausted(u16),
}

impl SendError {
    fn status(&self) -> Option<u16> {
        match self {
            SendError::Transport(_) => None,
            SendError::Status(code) | SendError::Exhausted(code) => Some(*code),
        }
    }

    fn into_adapter_error(self) -> AdapterError {
        match self {
            SendError::Transport(msg) => AdapterError::UpstreamTransient(msg),
            SendError::Exhausted(code) => {
                AdapterError::UpstreamTransient(format!("exhausted retries, last status {code}"))
            }
            SendError::Status(code) => {
                AdapterError::UpstreamFatal(format!("grok request failed: {code}"))
            }
        }
    }
}

pub struct GrokProvider {
    client: Client,
    config: GrokConfig,
    accounts_root: PathBuf,
    selector: Arc<CredentialPoolSelector>,
    proxy: Arc<ProxyPool>,
    media_images: Arc<MediaCache>,
    media_videos: Arc<MediaCache>,
    store: AsyncMutex<GrokTokenStore>,
}

impl GrokProvider {
    pub fn new(
        config: GrokConfig,
        accounts_root: PathBuf,
        selector: Arc<CredentialPoolSelector>,
        proxy: Arc<ProxyPool>,
        media_images: Arc<MediaCache>,
        media_videos: Arc<MediaCache>,
    ) -> anyhow::Result<Self> {
        let store = GrokTokenStore::load(&accounts_root)?;
        Ok(Self {
            client: Client::new(),
            config,
            accounts_root,
            selector,
            proxy,
            media_images,
            media_videos,
            store: AsyncMutex::new(store),
        })
    }

    fn pool_key(heavy: bool) -> &'static str {
        if heavy {
            "grok-4-heavy"
        } else {
            "grok-normal"
        }
    }

    /// HTTP client for the next outbound call: direct, or routed
    /// through whatever the proxy pool currently hands out.
    async fn egress_client(&self) -> Client {
        let Some(proxy_url) = self.proxy.current(relay_store::fetch_pool_proxy).await else {
            return self.client.clone();
        };
        let proxy = match reqwest::Proxy::all(&proxy_url) {
            Ok(p) => p,
            Err(err) => {
                warn!(%err, %proxy_url, "unusable egress proxy; going direct");
                return self.client.clone();
            }
        };
        match Client::builder().proxy(proxy).build() {
            Ok(client) => client,
            Err(err) => {
                warn!(%err, "failed to build proxied client; going direct");
                self.client.clone()
            }
        }
    }

    /// Rank eligible tokens and lease the best one via the shared
    /// selector. Returns the sso value and whether it came from the
    /// super tier.
    async fn pick_token(&self, heavy: bool) -> Result<(String, bool), AdapterError> {
        let store = self.store.lock().await;
        let normal: Vec<(String, GrokTokenEntry)> = store
            .sso_normal
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let super_tier: Vec<(String, GrokTokenEntry)> = store
            .sso_super
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        drop(store);

        let ranked = grok::rank_tokens(&normal, &super_tier, heavy);
        let sso = self
            .selector
            .acquire_ranked(Self::pool_key(heavy), &ranked)
            .ok_or(AdapterError::NoAccount(503))?;

        let store = self.store.lock().await;
        let is_super = store.sso_super.contains_key(&sso);
        drop(store);

        Ok((sso, is_super))
    }

    async fn record_success(&self, sso: &str, is_super: bool) {
        let mut store = self.store.lock().await;
        let map = if is_super { &mut store.sso_super } else { &mut store.sso_normal };
        if let Some(entry) = map.get_mut(sso) {
            entry.record_success();
        }
        let _ = store.save(&self.accounts_root);
    }

    async fn record_failure(&self, sso: &str, is_super: bool, reason: &str, expire_eligible: bool) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut store = self.store.lock().await;
        let map = if is_super { &mut store.sso_super } else { &mut store.sso_normal };
        if let Some(entry) = map.get_mut(sso) {
            entry.record_failure(reason, now_ms, expire_eligible);
        }
        let _ = store.save(&self.accounts_root);
    }

    fn baseline_headers(&self, content_type: &'static str) -> Vec<(&'static str, String)> {
        vec![
            ("User-Agent", "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36".to_string()),
            ("Accept-Language", "en-US,en;q=0.9".to_string()),
            ("Sec-Ch-Ua", "\"Chromium\";v=\"124\", \"Not.A/Brand\";v=\"24\"".to_string()),
            ("Sec-Ch-Ua-Mobile", "?0".to_string()),
            ("Sec-Ch-Ua-Platform", "\"Linux\"".to_string()),
            ("Origin", "https://grok.com".to_string()),
            ("Baggage", "sentry-environment=production".to_string()),
            ("Content-Type", content_type.to_string()),
        ]
    }

    fn statsig_id(&self) -> String {
        if self.config.dynamic_statsig {
            grok::generate_dynamic_statsig_id(&mut rand::thread_rng())
        } else {
            self.config.x_statsig_id.clone().unwrap_or_default()
        }
    }

    fn apply_common_headers(&self, req: reqwest::RequestBuilder, cookie: &str, content_type: &'static str) -> reqwest::RequestBuilder {
        let mut req = req.header("Cookie", cookie);
        for (name, value) in self.baseline_headers(content_type) {
            req = req.header(name, value);
        }
        req.header("x-statsig-id", self.statsig_id())
            .header("x-xai-request-id", uuid::Uuid::new_v4().to_string())
    }

    /// Send `build` with the retry policy shared by every Grok call:
    /// outer retries with linear backoff on `retry_status_codes`, inner
    /// retries on 403 where each attempt forces a proxy-pool refresh
    /// before pausing. Each attempt gets a freshly selected egress
    /// client so a refreshed proxy takes effect immediately.
    async fn send_with_retries<B>(&self, build: B) -> Result<reqwest::Response, SendError>
    where
        B: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let mut last_status = 0u16;
        for outer in 0..grok::OUTER_RETRIES {
            for _inner in 0..=grok::INNER_403_RETRIES {
                let client = self.egress_client().await;
                let resp = build(&client)
                    .send()
                    .await
                    .map_err(|e| SendError::Transport(e.to_string()))?;

                let code = resp.status().as_u16();
                if resp.status().is_success() {
                    return Ok(resp);
                }

                if code == 403 {
                    last_status = 403;
                    self.proxy.force_refresh(relay_store::fetch_pool_proxy).await;
                    tokio::time::sleep(Duration::from_millis(grok::INNER_403_PAUSE_MS)).await;
                    continue;
                }

                if self.config.retry_status_codes.contains(&code) {
                    last_status = code;
                    tokio::time::sleep(Duration::from_millis(grok::outer_backoff_ms(outer))).await;
                    break;
                }

                return Err(SendError::Status(code));
            }
        }
        Err(SendError::Exhausted(last_status))
    }

    fn extract_prompt_text(request: &MiddleRequest) -> String {
        request
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn extract_image_attachments(request: &MiddleRequest) -> Vec<String> {
        request
            .messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter_map(|tc| match tc {
                ToolCall::InlineData { inline_data, .. } => Some(inline_data.data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Upload endpoints take the JSON body with a
    /// `text/plain;charset=UTF-8` content type, unlike every other
    /// Grok call.
    async fn upload_file(&self, cookie: &str, base64_data: &str, mime: &str) -> Result<(String, String), AdapterError> {
        let body = json!({
            "fileName": "upload.bin",
            "fileMimeType": mime,
            "content": base64_data,
        });
        let resp = self
            .send_with_retries(|client| {
                self.apply_common_headers(
                    client.post(format!("{}{UPLOAD_PATH}", self.config.base_url)),
                    cookie,
                    "text/plain;charset=UTF-8",
                )
                .body(body.to_string())
            })
            .await
            .map_err(SendError::into_adapter_error)?;

        let value: Value = resp.json().await.map_err(|e| AdapterError::UpstreamFatal(e.to_string()))?;
        let id = value["fileMetadataId"].as_str().unwrap_or_default().to_string();
        let uri = value["fileUri"].as_str().unwrap_or_default().to_string();
        Ok((id, uri))
    }

    async fn create_post(&self, cookie: &str, file_id: &str, file_uri: &str) -> Result<String, AdapterError> {
        let body = json!({ "fileId": file_id, "fileUri": file_uri });
        let resp = self
            .send_with_retries(|client| {
                self.apply_common_headers(
                    client.post(format!("{}{CREATE_POST_PATH}", self.config.base_url)),
                    cookie,
                    "application/json",
                )
                .json(&body)
            })
            .await
            .map_err(SendError::into_adapter_error)?;
        let value: Value = resp.json().await.map_err(|e| AdapterError::UpstreamFatal(e.to_string()))?;
        value["postId"].as_str().map(str::to_string).ok_or_else(|| {
            AdapterError::UpstreamFatal("create-post response missing postId".to_string())
        })
    }

    /// Poll `/rest/rate-limits` for `rate_limit_model_id` and write the
    /// observed quota back to the token store. Heavy quotas come from
    /// `remainingQueries`, normal-tier quotas from `remainingTokens`.
    pub async fn refresh_rate_limits(&self, sso: &str, is_super: bool, rate_limit_model_id: &str, heavy: bool) -> anyhow::Result<()> {
        let cookie = grok::upstream_cookie(sso);
        let body = json!({ "requestKind": "DEFAULT", "modelName": rate_limit_model_id });
        let resp = self
            .send_with_retries(|client| {
                self.apply_common_headers(
                    client.post(format!("{}{RATE_LIMITS_PATH}", self.config.base_url)),
                    &cookie,
                    "application/json",
                )
                .json(&body)
            })
            .await
            .map_err(|e| anyhow::Error::new(e.into_adapter_error()))?;
        let value: Value = resp.json().await?;

        let mut store = self.store.lock().await;
        let map = if is_super { &mut store.sso_super } else { &mut store.sso_normal };
        if let Some(entry) = map.get_mut(sso) {
            if heavy {
                if let Some(q) = value["remainingQueries"].as_i64() {
                    entry.heavy_remaining_queries = q;
                }
            } else if let Some(t) = value["remainingTokens"].as_i64() {
                entry.remaining_queries = t;
            }
        }
        store.save(&self.accounts_root)?;
        Ok(())
    }

    /// Background quota refresher: every 10 minutes, poll rate limits
    /// for every live token, pausing a second between tokens so the
    /// polling itself never trips a rate limit. Start is delayed 5 s
    /// after boot.
    pub fn spawn_background_refresher(self: Arc<Self>) {
        if !self.config.auto_refresh_tokens {
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            loop {
                self.run_refresh_pass().await;
                tokio::time::sleep(Duration::from_secs(10 * 60)).await;
            }
        });
    }

    async fn run_refresh_pass(&self) {
        let snapshot: Vec<(String, bool)> = {
            let store = self.store.lock().await;
            store
                .sso_normal
                .keys()
                .map(|k| (k.clone(), false))
                .chain(store.sso_super.keys().map(|k| (k.clone(), true)))
                .collect()
        };

        for (sso, is_super) in snapshot {
            let eligible = {
                let store = self.store.lock().await;
                let map = if is_super { &store.sso_super } else { &store.sso_normal };
                map.get(&sso).map(|e| !e.is_expired()).unwrap_or(false)
            };
            if !eligible {
                continue;
            }

            if let Err(err) = self.refresh_rate_limits(&sso, is_super, "grok-3", false).await {
                warn!(%err, "background refresh of normal-tier quota failed");
            }
            if let Err(err) = self.refresh_rate_limits(&sso, is_super, "grok-4-heavy", true).await {
                warn!(%err, "background refresh of heavy-tier quota failed");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

/// One asset download from `assets.grok.com`, authenticated with the
/// same SSO cookie as the originating completion.
async fn fetch_asset(client: Client, cookie: String, remote_path: String, timeout: Duration) -> anyhow::Result<Vec<u8>> {
    let resp = client
        .get(format!("{ASSETS_BASE}/{}", remote_path.trim_start_matches('/')))
        .header("Cookie", cookie)
        .timeout(timeout)
        .send()
        .await?;
    if !resp.status().is_success() {
        anyhow::bail!("asset fetch failed: {}", resp.status());
    }
    Ok(resp.bytes().await?.to_vec())
}

#[async_trait]
impl ModelProvider for GrokProvider {
    fn name(&self) -> &str {
        "grok"
    }

    fn models(&self) -> Vec<String> {
        grok::GROK_MODELS.iter().map(|m| m.id.to_string()).collect()
    }

    async fn handle(&self, request: MiddleRequest, _caller_bearer: &str) -> Result<HandleResult, AdapterError> {
        let entry = grok::model_entry(&request.model)
            .ok_or_else(|| AdapterError::BadRequest(format!("unknown grok model '{}'", request.model)))?;
        let heavy = grok::is_heavy(&request.model);

        let (sso, is_super) = self.pick_token(heavy).await?;
        let cookie = grok::upstream_cookie(&sso);

        let prompt_text = Self::extract_prompt_text(&request);
        let image_attachments = Self::extract_image_attachments(&request);
        let prompt_tokens: u32 = request
            .messages
            .iter()
            .map(|m| estimator::estimate_message(&m.content))
            .sum();

        let is_image_to_video = request.model == "grok-imagine-0.9" && !image_attachments.is_empty();

        let body = if is_image_to_video {
            let (file_id, file_uri) = match self.upload_file(&cookie, &image_attachments[0], "image/png").await {
                Ok(v) => v,
                Err(err) => {
                    self.selector.release(&sso);
                    return Err(err);
                }
            };
            let post_id = match self.create_post(&cookie, &file_id, &file_uri).await {
                Ok(v) => v,
                Err(err) => {
                    self.selector.release(&sso);
                    return Err(err);
                }
            };
            grok::build_image_to_video_payload(&post_id, &prompt_text, &file_id)
        } else {
            grok::build_text_payload(entry, &prompt_text, &[], &image_attachments, self.config.temporary)
        };

        let resp = self
            .send_with_retries(|client| {
                self.apply_common_headers(
                    client.post(format!("{}{COMPLETION_PATH}", self.config.base_url)),
                    &cookie,
                    "application/json",
                )
                .json(&body)
            })
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(send_err) => {
                let expire_eligible = send_err
                    .status()
                    .map(|code| (400..500).contains(&code))
                    .unwrap_or(false);
                let err = send_err.into_adapter_error();
                self.record_failure(&sso, is_super, &err.to_string(), expire_eligible).await;
                self.selector.release(&sso);
                return Err(err);
            }
        };

        self.record_success(&sso, is_super).await;

        // Write the post-request quota back so the next ranking pass
        // sees it; a failed poll is only a warning.
        if let Err(err) = self
            .refresh_rate_limits(&sso, is_super, entry.rate_limit_model_id, heavy)
            .await
        {
            warn!(%err, "rate-limit poll after completion failed");
        }

        let filtered_tags = self.config.filtered_tags.clone();
        let show_thinking = self.config.show_thinking;
        let image_mode = self.config.image_mode.clone();
        let media_images = self.media_images.clone();
        let media_videos = self.media_videos.clone();
        let byte_stream = resp.bytes_stream();
        let cookie_for_stream = cookie.clone();
        let asset_client = self.egress_client().await;

        let stream = async_stream::try_stream! {
            let mut buffer = String::new();
            let mut accumulated = String::new();
            let mut role_emitted = false;
            let mut finished = false;
            futures::pin_mut!(byte_stream);

            'outer: while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk.map_err(|e| anyhow::anyhow!(e))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                for line in grok::drain_complete_ndjson_lines(&mut buffer) {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match grok::parse_ndjson_line(&line) {
                        Ok(GrokChunk::Token { text, is_thinking }) => {
                            if !show_thinking && is_thinking {
                                continue;
                            }
                            if grok::token_is_filtered(&text, &filtered_tags) {
                                continue;
                            }
                            accumulated.push_str(&text);
                            if !role_emitted {
                                role_emitted = true;
                                yield relay_convert::ResponseEvent::RoleAssistant;
                            }
                            yield relay_convert::ResponseEvent::ContentDelta(text);
                        }
                        Ok(GrokChunk::GeneratedImages(urls)) => {
                            for url in urls {
                                let resolved = if matches!(image_mode, relay_config::ImageMode::Base64) {
                                    let fetch_client = asset_client.clone();
                                    let fetch_cookie = cookie_for_stream.clone();
                                    let fetch_url = url.clone();
                                    media_images.get_as_base64(&url, "image/jpeg", || {
                                        fetch_asset(fetch_client, fetch_cookie, fetch_url, IMAGE_FETCH_TIMEOUT)
                                    }).await?
                                } else {
                                    let fetch_client = asset_client.clone();
                                    let fetch_cookie = cookie_for_stream.clone();
                                    let fetch_url = url.clone();
                                    media_images.get(&url, || {
                                        fetch_asset(fetch_client, fetch_cookie, fetch_url, IMAGE_FETCH_TIMEOUT)
                                    }).await?;
                                    format!("/images/image/{}", crate::media_cache::flatten_path(&url))
                                };
                                if !role_emitted {
                                    role_emitted = true;
                                    yield relay_convert::ResponseEvent::RoleAssistant;
                                }
                                yield relay_convert::ResponseEvent::ContentDelta(grok::image_markdown(&resolved));
                            }
                            let completion_tokens = estimator::estimate_text(&accumulated);
                            yield relay_convert::ResponseEvent::Done {
                                finish_reason: "stop".to_string(),
                                usage: Some(relay_convert::Usage::new(prompt_tokens, completion_tokens)),
                            };
                            finished = true;
                        }
                        Ok(GrokChunk::VideoUrl(url)) => {
                            let fetch_client = asset_client.clone();
                            let fetch_cookie = cookie_for_stream.clone();
                            let fetch_url = url.clone();
                            media_videos.get(&url, || {
                                fetch_asset(fetch_client, fetch_cookie, fetch_url, VIDEO_FETCH_TIMEOUT)
                            }).await?;
                            let local_url = format!("/images/video/{}", crate::media_cache::flatten_path(&url));
                            if !role_emitted {
                                role_emitted = true;
                                yield relay_convert::ResponseEvent::RoleAssistant;
                            }
                            yield relay_convert::ResponseEvent::ContentDelta(grok::video_html(&local_url));
                            let completion_tokens = estimator::estimate_text(&accumulated);
                            yield relay_convert::ResponseEvent::Done {
                                finish_reason: "stop".to_string(),
                                usage: Some(relay_convert::Usage::new(prompt_tokens, completion_tokens)),
                            };
                            finished = true;
                        }
                        Ok(GrokChunk::Ignored) => {}
                        Err(err) => {
                            debug!(%err, "unparseable grok ndjson line");
                        }
                    }
                    if finished {
                        break 'outer;
                    }
                }
            }

            if !finished {
                let completion_tokens = estimator::estimate_text(&accumulated);
                yield relay_convert::ResponseEvent::Done {
                    finish_reason: "stop".to_string(),
                    usage: Some(relay_convert::Usage::new(prompt_tokens, completion_tokens)),
                };
            }
        };

        Ok(HandleResult {
            stream: Box::pin(stream) as ResponseStream,
            state: HandleState { credential_id: Some(sso), model_id: request.model },
            session_id: None,
        })
    }

    async fn release(&self, state: HandleState) {
        if let Some(sso) = state.credential_id {
            self.selector.release(&sso);
        }
        info!(model = %state.model_id, "released Grok token lease");
    }
}
