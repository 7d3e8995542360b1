// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Token-file cache.
//!
//! Read-through cache over `accounts/<project>/**/*.json`, with
//! authoritative invalidation driven by a filesystem watcher and by
//! mutating management-surface endpoints. Entries live 5 minutes,
//! directory scans 30 seconds; a watcher event cuts both short.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const ENTRY_TTL: Duration = Duration::from_secs(5 * 60);
const SCAN_TTL: Duration = Duration::from_secs(30);

struct TokenEntry {
    data: Value,
    loaded_at: Instant,
}

#[derive(Default)]
struct ProjectState {
    entries: HashMap<String, TokenEntry>,
    file_list: Vec<String>,
    last_scan: Option<Instant>,
    /// Kept alive for as long as this project is watched; dropping it
    /// stops the underlying OS watch.
    watcher: Option<RecommendedWatcher>,
}

/// Process-wide read-through cache over credential directories.
///
/// Other processes mutating the same directory tree are explicitly
/// unsupported — invalidation is driven by this process's own watcher
/// and its own management-endpoint writes.
pub struct TokenFileCache {
    root: PathBuf,
    projects: Arc<Mutex<HashMap<String, ProjectState>>>,
}

impl TokenFileCache {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            projects: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join(project)
    }

    /// Returns a fresh copy of the parsed credential file, or `None`
    /// if the file doesn't exist. A missing file removes any stale
    /// cache entry.
    pub async fn get_token(&self, project: &str, filename: &str) -> Option<Value> {
        {
            let projects = self.projects.lock().expect("cache mutex poisoned");
            if let Some(state) = projects.get(project) {
                if let Some(entry) = state.entries.get(filename) {
                    if entry.loaded_at.elapsed() < ENTRY_TTL {
                        return Some(entry.data.clone());
                    }
                }
            }
        }

        let path = self.project_dir(project).join(filename);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(data) => {
                    let mut projects = self.projects.lock().expect("cache mutex poisoned");
                    let state = projects.entry(project.to_string()).or_default();
                    state.entries.insert(
                        filename.to_string(),
                        TokenEntry {
                            data: data.clone(),
                            loaded_at: Instant::now(),
                        },
                    );
                    Some(data)
                }
                Err(err) => {
                    warn!(%project, %filename, %err, "corrupt credential file");
                    None
                }
            },
            Err(_) => {
                self.invalidate_token(project, filename);
                None
            }
        }
    }

    /// Returns the cached directory listing if younger than 30s,
    /// otherwise rescans and (re)installs a watcher.
    pub async fn get_token_list(&self, project: &str) -> Vec<String> {
        let needs_scan = {
            let projects = self.projects.lock().expect("cache mutex poisoned");
            match projects.get(project) {
                Some(state) => match state.last_scan {
                    Some(at) => at.elapsed() >= SCAN_TTL,
                    None => true,
                },
                None => true,
            }
        };

        if !needs_scan {
            let projects = self.projects.lock().expect("cache mutex poisoned");
            return projects
                .get(project)
                .map(|s| s.file_list.clone())
                .unwrap_or_default();
        }

        self.rescan(project).await
    }

    async fn rescan(&self, project: &str) -> Vec<String> {
        let dir = self.project_dir(project);
        let mut files = Vec::new();

        if let Ok(mut read_dir) = tokio::fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = read_dir.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".json") {
                    files.push(name);
                }
            }
        }
        files.sort();

        let mut projects = self.projects.lock().expect("cache mutex poisoned");
        let state = projects.entry(project.to_string()).or_default();
        state.file_list = files.clone();
        state.last_scan = Some(Instant::now());

        if state.watcher.is_none() {
            drop(projects);
            self.install_watcher(project);
        }

        files
    }

    /// Install a filesystem watcher for `project`'s directory. Watcher
    /// construction failures are logged and the cache simply degrades
    /// to TTL-only invalidation, per the watcher contract.
    fn install_watcher(&self, project: &str) {
        let dir = self.project_dir(project);
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        });

        let mut watcher = match watcher {
            Ok(w) => w,
            Err(err) => {
                warn!(%project, %err, "failed to construct filesystem watcher");
                return;
            }
        };

        if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!(%project, %err, "failed to watch credential directory");
            return;
        }

        {
            let mut projects = self.projects.lock().expect("cache mutex poisoned");
            if let Some(state) = projects.get_mut(project) {
                state.watcher = Some(watcher);
            }
        }

        let project = project.to_string();
        let projects = self.projects.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for path in event.paths {
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
                        debug!(%project, %filename, "credential file changed on disk");
                        let mut projects = projects.lock().expect("cache mutex poisoned");
                        if let Some(state) = projects.get_mut(&project) {
                            state.entries.remove(filename);
                            state.last_scan = None;
                        }
                    }
                }
            }
        });
    }

    pub fn invalidate_token(&self, project: &str, filename: &str) {
        let mut projects = self.projects.lock().expect("cache mutex poisoned");
        if let Some(state) = projects.get_mut(project) {
            state.entries.remove(filename);
            state.last_scan = None;
        }
    }

    pub fn invalidate_project(&self, project: &str) {
        let mut projects = self.projects.lock().expect("cache mutex poisoned");
        if let Some(state) = projects.get_mut(project) {
            state.entries.clear();
            state.last_scan = None;
        }
    }

    /// Eagerly populate every entry for `project`.
    pub async fn preload_project(&self, project: &str) {
        let files = self.get_token_list(project).await;
        for filename in files {
            self.get_token(project, &filename).await;
        }
    }

    /// `getAllTokens`: concatenation of `getToken` over `getTokenList`,
    /// fetched concurrently.
    pub async fn get_all_tokens(&self, project: &str) -> Vec<(String, Value)> {
        let files = self.get_token_list(project).await;
        let futures = files.into_iter().map(|filename| async move {
            let data = self.get_token(project, &filename).await;
            data.map(|d| (filename, d))
        });
        futures::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn cache_stats(&self) -> HashMap<String, usize> {
        let projects = self.projects.lock().expect("cache mutex poisoned");
        projects
            .iter()
            .map(|(name, state)| (name.clone(), state.entries.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_json(dir: &Path, name: &str, value: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(value.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn get_token_reads_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("deepseek");
        std::fs::create_dir_all(&project_dir).unwrap();
        write_json(&project_dir, "a.json", r#"{"token":"v1"}"#);

        let cache = TokenFileCache::new(dir.path());
        let v = cache.get_token("deepseek", "a.json").await.unwrap();
        assert_eq!(v["token"], "v1");
    }

    #[tokio::test]
    async fn get_token_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenFileCache::new(dir.path());
        assert!(cache.get_token("deepseek", "nope.json").await.is_none());
    }

    #[tokio::test]
    async fn get_token_list_filters_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("deepseek");
        std::fs::create_dir_all(&project_dir).unwrap();
        write_json(&project_dir, "a.json", "{}");
        std::fs::write(project_dir.join("notes.txt"), "ignore me").unwrap();

        let cache = TokenFileCache::new(dir.path());
        let files = cache.get_token_list("deepseek").await;
        assert_eq!(files, vec!["a.json".to_string()]);
    }

    #[tokio::test]
    async fn invalidate_token_forces_reread() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("deepseek");
        std::fs::create_dir_all(&project_dir).unwrap();
        write_json(&project_dir, "a.json", r#"{"token":"v1"}"#);

        let cache = TokenFileCache::new(dir.path());
        assert_eq!(
            cache.get_token("deepseek", "a.json").await.unwrap()["token"],
            "v1"
        );

        write_json(&project_dir, "a.json", r#"{"token":"v2"}"#);
        cache.invalidate_token("deepseek", "a.json");

        assert_eq!(
            cache.get_token("deepseek", "a.json").await.unwrap()["token"],
            "v2"
        );
    }

    #[tokio::test]
    async fn watcher_invalidates_changed_file_without_waiting_for_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("deepseek");
        std::fs::create_dir_all(&project_dir).unwrap();
        write_json(&project_dir, "a.json", r#"{"token":"v1"}"#);

        let cache = TokenFileCache::new(dir.path());
        assert_eq!(
            cache.get_token("deepseek", "a.json").await.unwrap()["token"],
            "v1"
        );
        // get_token_list installs the watcher.
        cache.get_token_list("deepseek").await;

        write_json(&project_dir, "a.json", r#"{"token":"v2"}"#);

        // Give the watcher a moment to deliver the event; poll instead
        // of a single fixed sleep to keep this robust under load.
        let mut seen_v2 = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(v) = cache.get_token("deepseek", "a.json").await {
                if v["token"] == "v2" {
                    seen_v2 = true;
                    break;
                }
            }
        }
        assert!(seen_v2, "watcher must invalidate the entry on file change");
    }

    #[tokio::test]
    async fn preload_project_populates_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("deepseek");
        std::fs::create_dir_all(&project_dir).unwrap();
        write_json(&project_dir, "a.json", "{}");
        write_json(&project_dir, "b.json", "{}");

        let cache = TokenFileCache::new(dir.path());
        cache.preload_project("deepseek").await;
        assert_eq!(cache.cache_stats()["deepseek"], 2);
    }
}
