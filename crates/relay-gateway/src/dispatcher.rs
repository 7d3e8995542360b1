// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ingress-agnostic core: runs a [`MiddleRequest`] through the
//! provider registered for its model and renders the result either as
//! a forwarded SSE stream or an aggregated JSON body.
//!
//! Retry and skip logic belongs to the adapters; this layer only maps
//! outcomes to HTTP. Whatever lease the adapter captured is released
//! exactly once on every exit path, including a client that walks away
//! mid-stream.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::StreamExt;
use relay_convert::response::{render_chunk, Aggregated, DONE_FRAME};
use relay_convert::{gemini, MiddleRequest, ResponseEvent};
use relay_providers::{AdapterError, HandleState, ModelProvider, ResponseStream};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::state::GatewayState;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum IngressKind {
    OpenAi,
    Anthropic,
    GeminiStream,
    GeminiNonStream,
}

/// Render an [`AdapterError`] as the ingress-appropriate error body.
pub fn adapter_error_response(kind: IngressKind, err: &AdapterError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match kind {
        IngressKind::OpenAi => json!({ "error": { "message": err.to_string(), "type": "invalid_request_error" } }),
        IngressKind::Anthropic => json!({ "type": "error", "error": { "type": "api_error", "message": err.to_string() } }),
        IngressKind::GeminiStream | IngressKind::GeminiNonStream => {
            gemini::error_envelope(status.as_u16(), &err.to_string())
        }
    };
    (status, axum::Json(body)).into_response()
}

pub fn bad_request(kind: IngressKind, message: impl Into<String>) -> Response {
    adapter_error_response(kind, &AdapterError::BadRequest(message.into()))
}

/// Look up the provider for `request.model`, distinguishing "never
/// heard of this model" (400) from "known but no adapter registered",
/// i.e. a reserved slot (503).
pub fn resolve_provider(state: &GatewayState, model: &str) -> Result<Arc<dyn ModelProvider>, AdapterError> {
    if let Some(provider) = state.provider_for_model(model) {
        return Ok(provider);
    }
    match relay_providers::driver_for_model(model) {
        Some(_) => Err(AdapterError::NoAccount(503)),
        None => Err(AdapterError::BadRequest(format!("unknown model '{model}'"))),
    }
}

/// Emitted while the upstream is quiet so intermediaries don't drop
/// the connection.
const KEEP_ALIVE_FRAME: &str = ": keep-alive\n\n";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Releases the adapter's lease exactly once, even when the client
/// disconnects and the response body future is dropped mid-stream.
struct LeaseGuard {
    inner: Option<(Arc<dyn ModelProvider>, HandleState)>,
}

impl LeaseGuard {
    fn new(provider: Arc<dyn ModelProvider>, state: HandleState) -> Self {
        Self {
            inner: Some((provider, state)),
        }
    }

    async fn release(mut self) {
        if let Some((provider, state)) = self.inner.take() {
            provider.release(state).await;
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some((provider, state)) = self.inner.take() {
            tokio::spawn(async move { provider.release(state).await });
        }
    }
}

/// Run `request` against `provider` and render the response for
/// `kind`. The credential/session lease captured in the adapter's
/// `HandleState` is released exactly once, regardless of outcome.
pub async fn dispatch(
    provider: Arc<dyn ModelProvider>,
    request: MiddleRequest,
    caller_bearer: &str,
    kind: IngressKind,
) -> Response {
    let stream_requested = request.stream || matches!(kind, IngressKind::GeminiStream);
    let model = request.model.clone();

    let handled = match provider.handle(request, caller_bearer).await {
        Ok(h) => h,
        Err(err) => return adapter_error_response(kind, &err),
    };
    if let Some(session_id) = &handled.session_id {
        tracing::debug!(%session_id, %model, "upstream session opened");
    }

    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = Utc::now().timestamp();
    let guard = LeaseGuard::new(provider, handled.state);

    if stream_requested {
        render_stream(handled.stream, guard, id, created, model, kind)
    } else {
        render_aggregate(handled.stream, guard, id, created, model, kind).await
    }
}

fn render_stream(
    mut stream: ResponseStream,
    guard: LeaseGuard,
    id: String,
    created: i64,
    model: String,
    kind: IngressKind,
) -> Response {
    let frames = async_stream::stream! {
        let mut role_sent = false;
        loop {
            let event = match tokio::time::timeout(KEEP_ALIVE_INTERVAL, stream.next()).await {
                Err(_) => {
                    yield Ok::<_, std::convert::Infallible>(Bytes::from(KEEP_ALIVE_FRAME));
                    continue;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    tracing::warn!(%err, "stream read error; terminating early");
                    break;
                }
                Ok(Some(Ok(event))) => event,
            };
            match kind {
                IngressKind::GeminiStream => {
                    if let Some(frame) = gemini_frame(&id, created, &model, &mut role_sent, &event) {
                        yield Ok(Bytes::from(frame));
                    }
                }
                _ => {
                    let frame = render_chunk(&id, created, &model, &mut role_sent, &event);
                    yield Ok(Bytes::from(frame));
                }
            }
        }
        if !matches!(kind, IngressKind::GeminiStream | IngressKind::GeminiNonStream) {
            yield Ok(Bytes::from(DONE_FRAME));
        }
        guard.release().await;
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(frames))
        .expect("building SSE response")
}

async fn render_aggregate(
    mut stream: ResponseStream,
    guard: LeaseGuard,
    id: String,
    created: i64,
    model: String,
    kind: IngressKind,
) -> Response {
    let mut agg = Aggregated::new(id, model);
    while let Some(event) = stream.next().await {
        match event {
            Ok(e) => agg.apply(&e),
            Err(err) => {
                tracing::warn!(%err, "aggregation read error; terminating early");
                break;
            }
        }
    }
    guard.release().await;

    let body: Value = match kind {
        IngressKind::OpenAi => agg.to_openai_completion(created),
        IngressKind::Anthropic => agg.to_anthropic_completion(),
        IngressKind::GeminiStream | IngressKind::GeminiNonStream => agg.to_gemini_completion(),
    };
    (StatusCode::OK, axum::Json(body)).into_response()
}

/// Re-render one event as an OpenAI chunk, then rewrap it as a Gemini
/// `streamGenerateContent` frame. `Done` carries no text of its own in
/// the Gemini shape, so it produces no frame — Gemini streams end on
/// stream closure, not a sentinel frame.
fn gemini_frame(id: &str, created: i64, model: &str, role_sent: &mut bool, event: &ResponseEvent) -> Option<String> {
    if matches!(event, ResponseEvent::Done { .. }) {
        return None;
    }
    let chunk_frame = render_chunk(id, created, model, role_sent, event);
    let json_str = chunk_frame.strip_prefix("data: ")?.trim_end();
    let chunk: Value = serde_json::from_str(json_str).ok()?;
    Some(relay_convert::response::openai_chunk_to_gemini_sse(&chunk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_frame_rewraps_content_delta() {
        let mut role_sent = false;
        let frame = gemini_frame("id", 0, "m", &mut role_sent, &ResponseEvent::ContentDelta("hi".into())).unwrap();
        assert!(frame.contains("\"text\":\"hi\""));
        assert!(frame.contains("\"modelVersion\":\"m\""));
    }

    #[test]
    fn gemini_frame_drops_done_event() {
        let mut role_sent = false;
        let frame = gemini_frame(
            "id",
            0,
            "m",
            &mut role_sent,
            &ResponseEvent::Done { finish_reason: "stop".into(), usage: None },
        );
        assert!(frame.is_none());
    }
}
