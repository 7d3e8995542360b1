// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Egress proxy pool.
//!
//! Chooses the HTTP dispatcher (direct or proxied) per outbound
//! request, with pool-URL rotation triggered on a timer or on an
//! explicit `force_refresh()` (invoked after an upstream 403).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

const ACCEPTED_SCHEMES: &[&str] = &[
    "socks5h://", "socks5://", "sock5h://", "sock5://", "socks4://", "socks://", "http://",
    "https://",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub static_proxy: Option<String>,
    pub pool_url: Option<String>,
    pub interval: Duration,
}

struct PoolState {
    current_proxy: Option<String>,
    last_fetch_at: Option<Instant>,
    /// Disabled once `pool_url` is found to actually be a proxy URL.
    polling_enabled: bool,
}

/// Process-wide proxy pool. At most one refresh is ever in flight
/// because `maybe_refresh` takes the lock for its whole duration.
pub struct ProxyPool {
    config: ProxyConfig,
    state: Mutex<PoolState>,
}

/// Normalizes a raw scheme string into the canonical accepted scheme:
/// the `sock5://`/`sock5h://` typo variants and plain `socks5://` all
/// become `socks5h://` (remote DNS). Returns `None` if the scheme is
/// not recognized at all.
pub fn normalize_scheme(url: &str) -> Option<String> {
    let matched = ACCEPTED_SCHEMES
        .iter()
        .find(|scheme| url.starts_with(*scheme))?;

    let rest = &url[matched.len()..];
    let normalized_prefix = match *matched {
        "socks5://" | "sock5://" | "sock5h://" | "socks5h://" => "socks5h://",
        other => other,
    };
    Some(format!("{normalized_prefix}{rest}"))
}

fn looks_like_proxy_url(url: &str) -> bool {
    ACCEPTED_SCHEMES.iter().any(|scheme| url.starts_with(scheme))
}

/// Default pool fetcher: GET the pool URL and treat the trimmed body
/// as a single proxy string. Callers inject this into
/// [`ProxyPool::current`] / [`ProxyPool::force_refresh`]; tests inject
/// closures instead so they never touch the network.
pub async fn fetch_pool_proxy(pool_url: String) -> anyhow::Result<String> {
    let resp = reqwest::get(&pool_url).await?;
    if !resp.status().is_success() {
        anyhow::bail!("proxy pool returned {}", resp.status());
    }
    Ok(resp.text().await?.trim().to_string())
}

impl ProxyPool {
    pub fn new(mut config: ProxyConfig) -> Self {
        let mut polling_enabled = config.pool_url.is_some();

        if let Some(pool_url) = &config.pool_url {
            if looks_like_proxy_url(pool_url) {
                warn!(
                    pool_url = %pool_url,
                    "proxy_pool_url looks like a proxy URL itself; treating as static_proxy and disabling pool polling"
                );
                config.static_proxy = normalize_scheme(pool_url).or(Some(pool_url.clone()));
                config.pool_url = None;
                polling_enabled = false;
            }
        }

        Self {
            config,
            state: Mutex::new(PoolState {
                current_proxy: None,
                last_fetch_at: None,
                polling_enabled,
            }),
        }
    }

    fn needs_refresh(&self) -> bool {
        let state = self.state.lock().expect("proxy pool mutex poisoned");
        if !state.polling_enabled || self.config.pool_url.is_none() {
            return false;
        }
        match state.last_fetch_at {
            None => true,
            Some(at) => at.elapsed() >= self.config.interval,
        }
    }

    /// Return the proxy URL to use for the next outbound request,
    /// refreshing the pool first if due. `fetch` performs the actual
    /// GET against `pool_url` and is injected so tests don't need
    /// network access.
    pub async fn current<F, Fut>(&self, fetch: F) -> Option<String>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<String>>,
    {
        if self.needs_refresh() {
            if let Some(pool_url) = self.config.pool_url.clone() {
                self.do_refresh(pool_url, fetch).await;
            }
        }

        let state = self.state.lock().expect("proxy pool mutex poisoned");
        state
            .current_proxy
            .clone()
            .or_else(|| self.config.static_proxy.clone())
    }

    /// Force an immediate refresh, e.g. after an upstream 403.
    pub async fn force_refresh<F, Fut>(&self, fetch: F)
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<String>>,
    {
        if let Some(pool_url) = self.config.pool_url.clone() {
            self.do_refresh(pool_url, fetch).await;
        }
    }

    async fn do_refresh<F, Fut>(&self, pool_url: String, fetch: F)
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<String>>,
    {
        let result = fetch(pool_url).await;

        let mut state = self.state.lock().expect("proxy pool mutex poisoned");
        state.last_fetch_at = Some(Instant::now());

        match result {
            Ok(candidate) => match normalize_scheme(&candidate) {
                Some(normalized) => state.current_proxy = Some(normalized),
                None => {
                    warn!(candidate = %candidate, "proxy pool returned an unrecognized scheme; keeping previous value");
                }
            },
            Err(err) => {
                warn!(%err, "proxy pool refresh failed; keeping previous value");
            }
        }
    }
}
