// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The provider adapter contract every upstream driver implements.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use relay_convert::{MiddleRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("caller unauthorized")]
    CallerAuth,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("no account available")]
    NoAccount(u16),
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),
    #[error("upstream fatal failure: {0}")]
    UpstreamFatal(String),
    #[error("proof-of-work failure: {0}")]
    PowFailure(String),
}

impl AdapterError {
    /// HTTP status this error maps to. 429 means "try again later",
    /// 401 "caller unauthorized", 503 "no account available".
    pub fn status_code(&self) -> u16 {
        match self {
            AdapterError::CallerAuth => 401,
            AdapterError::BadRequest(_) => 400,
            AdapterError::NoAccount(status) => *status,
            AdapterError::UpstreamTransient(_) => 429,
            AdapterError::UpstreamFatal(_) => 500,
            AdapterError::PowFailure(_) => 500,
        }
    }
}

/// Opaque state an adapter's `handle()` call returns alongside the
/// stream, threaded back into `release()` on every exit path.
pub struct HandleState {
    pub credential_id: Option<String>,
    pub model_id: String,
}

pub struct HandleResult {
    pub stream: ResponseStream,
    pub state: HandleState,
    pub session_id: Option<String>,
}

/// Each upstream driver (DeepSeek, Grok, and reserved Claude/Kimi
/// slots) implements this contract. The dispatcher looks up a
/// provider by model id and never knows the driver-specific protocol.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    fn models(&self) -> Vec<String>;

    /// `caller_bearer` is the bearer token the gateway already
    /// validated against `config.keys`; some adapters (DeepSeek) use
    /// its *identity* again to decide whether to lease a pooled
    /// credential or pass the bearer straight through as the upstream
    /// token.
    async fn handle(
        &self,
        request: MiddleRequest,
        caller_bearer: &str,
    ) -> Result<HandleResult, AdapterError>;

    /// Release any pooled resource (credential lease, proxy slot)
    /// captured in `state`. Called exactly once per successful
    /// `handle()`, on every exit path.
    async fn release(&self, state: HandleState);
}
