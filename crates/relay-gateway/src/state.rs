// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared state threaded through every axum handler: the loaded
//! config, the process-wide subsystems from `relay-store`, the
//! registered provider adapters, and the admin session table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use relay_config::Config;
use relay_providers::{MediaCache, ModelProvider, ModelRegistry};
use relay_store::{CredentialPoolSelector, TokenFileCache};

use crate::admin::AdminSessions;
use crate::security::FailureLimiter;

/// Cheaply cloneable: every field is an `Arc` (or small/immutable),
/// so `GatewayState` itself is handed to axum's `State` extractor by
/// value per request.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub cache: Arc<TokenFileCache>,
    pub selector: Arc<CredentialPoolSelector>,
    pub registry: Arc<ModelRegistry>,
    /// Registered adapters keyed by owner tag ("deepseek", "grok", ...).
    pub providers: Arc<HashMap<String, Arc<dyn ModelProvider>>>,
    pub accounts_root: PathBuf,
    pub media_images: Arc<MediaCache>,
    pub media_videos: Arc<MediaCache>,
    pub admin_sessions: Arc<AdminSessions>,
    /// `NODE_ENV=production` → `Secure` flag on the session cookie.
    pub secure_cookies: bool,
    /// Charged only on failed caller/admin auth attempts.
    pub failure_limiter: Arc<FailureLimiter>,
}

impl GatewayState {
    pub fn provider_for_model(&self, model: &str) -> Option<Arc<dyn ModelProvider>> {
        let owner_tag = self.registry.owner_tag(model)?;
        self.providers.get(&owner_tag).cloned()
    }
}
