// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! On-disk media cache backing Grok's generated images/videos and
//! image-to-video source uploads.
//!
//! Network access and cookie/proxy plumbing live in the caller; this
//! module owns only the cache-key computation, the write-through, and
//! size-capped eviction by ascending mtime, with eviction runs
//! serialized so at most one ever runs at a time.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine;
use tracing::warn;

/// `cacheDir/flatten(path)`: collapse a remote path into a single
/// filename so nested remote directories never create local ones.
pub fn flatten_path(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "_")
}

pub struct MediaCache {
    cache_dir: PathBuf,
    max_size_bytes: u64,
    evicting: Arc<AtomicBool>,
}

impl MediaCache {
    pub fn new(cache_dir: impl Into<PathBuf>, max_size_mb: u64) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_size_bytes: max_size_mb * 1024 * 1024,
            evicting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn local_path(&self, remote_path: &str) -> PathBuf {
        self.cache_dir.join(flatten_path(remote_path))
    }

    /// Return the cached file for `remote_path`, fetching it via
    /// `fetch` on a cache miss. `fetch` is injected so callers control
    /// headers, cookies, proxy, retries, and timeouts.
    pub async fn get<F, Fut>(&self, remote_path: &str, fetch: F) -> anyhow::Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<u8>>>,
    {
        let local = self.local_path(remote_path);
        if tokio::fs::try_exists(&local).await.unwrap_or(false) {
            return Ok(local);
        }

        let bytes = fetch().await?;
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::write(&local, &bytes).await?;
        self.schedule_eviction();
        Ok(local)
    }

    /// `getAsBase64`: downloads (or reuses a cached file), reads it,
    /// deletes it, and returns a `data:` URL.
    pub async fn get_as_base64<F, Fut>(&self, remote_path: &str, mime: &str, fetch: F) -> anyhow::Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<u8>>>,
    {
        let local = self.get(remote_path, fetch).await?;
        let bytes = tokio::fs::read(&local).await?;
        if let Err(err) = tokio::fs::remove_file(&local).await {
            warn!(%err, path = %local.display(), "failed to remove media cache entry after base64 read");
        }
        Ok(format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        ))
    }

    /// Spawn an eviction pass unless one is already running.
    fn schedule_eviction(&self) {
        if self.evicting.swap(true, Ordering::SeqCst) {
            return;
        }
        let dir = self.cache_dir.clone();
        let cap = self.max_size_bytes;
        let evicting = self.evicting.clone();
        tokio::spawn(async move {
            if let Err(err) = evict_oldest_until_under_cap(&dir, cap).await {
                warn!(%err, dir = %dir.display(), "media cache eviction failed");
            }
            evicting.store(false, Ordering::SeqCst);
        });
    }
}

async fn evict_oldest_until_under_cap(dir: &Path, cap_bytes: u64) -> anyhow::Result<()> {
    let mut entries = Vec::new();
    let mut total: u64 = 0;

    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            total += meta.len();
            entries.push((entry.path(), meta.modified()?, meta.len()));
        }
    }

    if total <= cap_bytes {
        return Ok(());
    }

    entries.sort_by_key(|(_, mtime, _)| *mtime);
    for (path, _, len) in entries {
        if total <= cap_bytes {
            break;
        }
        if tokio::fs::remove_file(&path).await.is_ok() {
            total = total.saturating_sub(len);
        }
    }
    Ok(())
}
