// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level `config.yaml` document.
///
/// Deserialized once at boot and never mutated in place; the admin
/// password is normalized (hashed) immediately after load and the
/// document is rewritten to disk if it changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub admin: AdminConfig,

    /// Bearer tokens accepted on `/v1/*`.
    #[serde(default)]
    pub keys: Vec<String>,

    #[serde(default)]
    pub projects: HashMap<String, ProjectConfig>,

    #[serde(default)]
    pub grok: GrokConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageMode {
    Url,
    Base64,
}

impl Default for ImageMode {
    fn default() -> Self {
        ImageMode::Url
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrokConfig {
    #[serde(default = "default_true")]
    pub auto_refresh_tokens: bool,
    #[serde(default = "default_grok_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub x_statsig_id: Option<String>,
    #[serde(default)]
    pub dynamic_statsig: bool,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub proxy_pool_url: Option<String>,
    #[serde(default = "default_pool_interval")]
    pub proxy_pool_interval: u64,
    #[serde(default = "default_retry_status_codes")]
    pub retry_status_codes: Vec<u16>,
    #[serde(default = "default_filtered_tags")]
    pub filtered_tags: Vec<String>,
    #[serde(default)]
    pub show_thinking: bool,
    #[serde(default)]
    pub image_mode: ImageMode,
    #[serde(default = "default_cache_cap_mb")]
    pub image_cache_max_size_mb: u64,
    #[serde(default = "default_cache_cap_mb")]
    pub video_cache_max_size_mb: u64,
}

impl Default for GrokConfig {
    fn default() -> Self {
        Self {
            auto_refresh_tokens: true,
            base_url: default_grok_base_url(),
            x_statsig_id: None,
            dynamic_statsig: false,
            temporary: false,
            proxy_url: None,
            proxy_pool_url: None,
            proxy_pool_interval: default_pool_interval(),
            retry_status_codes: default_retry_status_codes(),
            filtered_tags: default_filtered_tags(),
            show_thinking: false,
            image_mode: ImageMode::default(),
            image_cache_max_size_mb: default_cache_cap_mb(),
            video_cache_max_size_mb: default_cache_cap_mb(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_grok_base_url() -> String {
    "https://grok.com".to_string()
}

fn default_pool_interval() -> u64 {
    300
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![401, 429]
}

fn default_filtered_tags() -> Vec<String> {
    vec![
        "xaiartifact".to_string(),
        "xai:tool_usage_card".to_string(),
        "grok:render".to_string(),
    ]
}

fn default_cache_cap_mb() -> u64 {
    512
}

impl Config {
    /// Names of projects with `enabled: true`.
    pub fn enabled_projects(&self) -> Vec<&str> {
        self.projects
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, _)| name.as_str())
            .collect()
    }

}
