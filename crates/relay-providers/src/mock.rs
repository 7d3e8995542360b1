// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pre-scripted mock provider for tests. Each `handle()` call pops the
//! next response script from the front of the queue, so tests can
//! specify exact event sequences without network access.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use relay_convert::{MiddleRequest, ResponseEvent};

use crate::provider::{AdapterError, HandleResult, HandleState, ModelProvider, ResponseStream};

pub struct ScriptedProvider {
    name: String,
    models: Vec<String>,
    scripts: Mutex<Vec<Vec<ResponseEvent>>>,
    /// Number of `release()` calls observed, for lease-discipline
    /// assertions.
    pub releases: Arc<AtomicUsize>,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<MiddleRequest>>>,
}

impl ScriptedProvider {
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is
    /// the event sequence emitted for that call.
    pub fn new(name: impl Into<String>, models: Vec<String>, scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            name: name.into(),
            models,
            scripts: Mutex::new(scripts),
            releases: Arc::new(AtomicUsize::new(0)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn handle(
        &self,
        request: MiddleRequest,
        _caller_bearer: &str,
    ) -> Result<HandleResult, AdapterError> {
        let model_id = request.model.clone();
        *self.last_request.lock().expect("mock mutex poisoned") = Some(request);

        let mut scripts = self.scripts.lock().expect("mock mutex poisoned");
        if scripts.is_empty() {
            return Err(AdapterError::NoAccount(503));
        }
        let events: Vec<anyhow::Result<ResponseEvent>> =
            scripts.remove(0).into_iter().map(Ok).collect();

        Ok(HandleResult {
            stream: Box::pin(stream::iter(events)) as ResponseStream,
            state: HandleState {
                credential_id: Some("mock-credential".to_string()),
                model_id,
            },
            session_id: None,
        })
    }

    async fn release(&self, _state: HandleState) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
