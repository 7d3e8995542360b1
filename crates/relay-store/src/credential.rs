// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Credential file formats and on-disk mutation.
//!
//! Two repository shapes share this module: a generic per-file store
//! (one JSON document per account, DeepSeek-style) and a single-file
//! multi-entry store (the Grok SSO token maps). Both write through the
//! same secure-file helper and both invalidate the shared
//! [`crate::cache::TokenFileCache`] on mutation.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::TokenFileCache;

/// A generic per-file credential record. Recognized fields beyond
/// `type` (`email`, `mobile`, `password`, `token`, `device_id`,
/// `proxy_url`) are provider-specific and kept as a raw JSON map so
/// unknown fields round-trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialFile {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl CredentialFile {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }
}

/// Write a new credential file under `accounts/<project>/<filename>`
/// and invalidate the project cache so the next read observes it.
/// Files are created mode 0600 on Unix; they hold login secrets.
pub async fn save_credential(
    root: &Path,
    cache: &TokenFileCache,
    project: &str,
    filename: &str,
    file: &CredentialFile,
) -> anyhow::Result<()> {
    let dir = root.join(project);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating project directory {}", dir.display()))?;

    let path = dir.join(filename);
    let json = serde_json::to_vec_pretty(file).context("serializing credential file")?;
    write_secret_file(&path, &json)
        .with_context(|| format!("writing credential file {}", path.display()))?;

    cache.invalidate_token(project, filename);
    Ok(())
}

pub fn delete_credential(root: &Path, project: &str, filename: &str) -> anyhow::Result<()> {
    let path = root.join(project).join(filename);
    std::fs::remove_file(&path)
        .with_context(|| format!("deleting credential file {}", path.display()))?;
    Ok(())
}

fn write_secret_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)?;
    }
    Ok(())
}

// ── Grok token store ──────────────────────────────────────────────────────────

/// A single Grok SSO token entry. Quota fields use −1 for "unknown",
/// 0 for "exhausted", and a positive value for a known residual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrokTokenEntry {
    #[serde(rename = "createdTime")]
    pub created_time: i64,
    #[serde(rename = "remainingQueries", default = "default_unknown_quota")]
    pub remaining_queries: i64,
    #[serde(rename = "heavyremainingQueries", default = "default_unknown_quota")]
    pub heavy_remaining_queries: i64,
    #[serde(default = "default_active")]
    pub status: String,
    #[serde(rename = "failedCount", default)]
    pub failed_count: u32,
    #[serde(rename = "lastFailureTime", default)]
    pub last_failure_time: Option<i64>,
    #[serde(rename = "lastFailureReason", default)]
    pub last_failure_reason: Option<String>,
}

fn default_unknown_quota() -> i64 {
    -1
}

fn default_active() -> String {
    "active".to_string()
}

impl GrokTokenEntry {
    /// A fresh entry with unknown quotas, stamped with the current
    /// wall-clock time in milliseconds.
    pub fn new_now() -> Self {
        Self {
            created_time: chrono::Utc::now().timestamp_millis(),
            remaining_queries: -1,
            heavy_remaining_queries: -1,
            status: default_active(),
            failed_count: 0,
            last_failure_time: None,
            last_failure_reason: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.status == "expired" || self.failed_count >= 3
    }

    pub fn field(&self, heavy: bool) -> i64 {
        if heavy {
            self.heavy_remaining_queries
        } else {
            self.remaining_queries
        }
    }

    pub fn record_success(&mut self) {
        self.failed_count = 0;
    }

    /// `expire_eligible` is true when the failure was a definitive
    /// client error (4xx); only those may flip the persisted status to
    /// `expired`. Transport errors and 5xx still accumulate
    /// `failed_count`, which alone makes the entry ineligible at 3.
    pub fn record_failure(&mut self, reason: &str, now_ms: i64, expire_eligible: bool) {
        self.failed_count += 1;
        self.last_failure_time = Some(now_ms);
        self.last_failure_reason = Some(reason.to_string());
        if expire_eligible && self.failed_count >= 3 {
            self.status = "expired".to_string();
        }
    }
}

/// `accounts/grok/token.json`: two maps of SSO value → entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrokTokenStore {
    #[serde(rename = "ssoNormal", default)]
    pub sso_normal: std::collections::HashMap<String, GrokTokenEntry>,
    #[serde(rename = "ssoSuper", default)]
    pub sso_super: std::collections::HashMap<String, GrokTokenEntry>,
}

impl GrokTokenStore {
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let path = root.join("grok").join("token.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, root: &Path) -> anyhow::Result<()> {
        let dir = root.join("grok");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("token.json");
        let json = serde_json::to_vec_pretty(self)?;
        write_secret_file(&path, &json)
    }

    pub fn insert_entry(&mut self, super_tier: bool, sso: &str, entry: GrokTokenEntry) {
        let map = if super_tier { &mut self.sso_super } else { &mut self.sso_normal };
        map.insert(sso.to_string(), entry);
    }

    pub fn delete_entry(&mut self, super_tier: bool, sso: &str) -> bool {
        if super_tier {
            self.sso_super.remove(sso).is_some()
        } else {
            self.sso_normal.remove(sso).is_some()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grok_entry_expires_at_three_failures() {
        let mut e = GrokTokenEntry {
            created_time: 0,
            remaining_queries: 5,
            heavy_remaining_queries: -1,
            status: "active".into(),
            failed_count: 0,
            last_failure_time: None,
            last_failure_reason: None,
        };
        assert!(!e.is_expired());
        e.record_failure("401", 1, true);
        e.record_failure("401", 2, true);
        assert!(!e.is_expired());
        e.record_failure("401", 3, true);
        assert!(e.is_expired());
        assert_eq!(e.status, "expired");
    }

    #[test]
    fn transport_failures_accumulate_without_flipping_status() {
        let mut e = GrokTokenEntry::new_now();
        e.record_failure("connect timeout", 1, false);
        e.record_failure("connect timeout", 2, false);
        e.record_failure("connect timeout", 3, false);
        // Ineligible by count, but the persisted status stays active.
        assert!(e.is_expired());
        assert_eq!(e.status, "active");
    }

    #[test]
    fn grok_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = GrokTokenStore::default();
        store.sso_normal.insert(
            "ssoA".into(),
            GrokTokenEntry {
                created_time: 1,
                remaining_queries: -1,
                heavy_remaining_queries: -1,
                status: "active".into(),
                failed_count: 0,
                last_failure_time: None,
                last_failure_reason: None,
            },
        );
        store.save(dir.path()).unwrap();

        let loaded = GrokTokenStore::load(dir.path()).unwrap();
        assert!(loaded.sso_normal.contains_key("ssoA"));
    }

    #[test]
    fn delete_entry_removes_from_correct_tier() {
        let mut store = GrokTokenStore::default();
        store.sso_super.insert(
            "ssoB".into(),
            GrokTokenEntry {
                created_time: 1,
                remaining_queries: -1,
                heavy_remaining_queries: 5,
                status: "active".into(),
                failed_count: 0,
                last_failure_time: None,
                last_failure_reason: None,
            },
        );
        assert!(store.delete_entry(true, "ssoB"));
        assert!(store.sso_super.is_empty());
        assert!(!store.delete_entry(false, "ssoB"));
    }
}
