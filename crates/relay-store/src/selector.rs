// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Credential pool selector.
//!
//! Per-model ring of credential ids with round-robin scanning, a
//! per-(model, credential) skip window, and exclusive `in_use`
//! leasing. A lease holder is the only legitimate mutator of the
//! `in_use` flag until it calls [`CredentialPoolSelector::release`].

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_SKIP_MS: u64 = 30_000;

#[derive(Debug, Default)]
struct ModelRing {
    owner_tag: String,
    ring: Vec<String>,
    cursor: usize,
    in_use: HashSet<String>,
    skip_until: HashMap<String, Instant>,
}

impl ModelRing {
    fn contains(&self, credential_id: &str) -> bool {
        self.ring.iter().any(|c| c == credential_id)
    }
}

/// Process-wide mutable pool of credential rings, one per model.
///
/// All mutation is guarded by a single `Mutex`; every `acquire` call
/// advances the ring cursor deterministically regardless of outcome,
/// so a full scan that finds nothing still moves the cursor by
/// exactly `ring.len()` positions.
pub struct CredentialPoolSelector {
    models: Mutex<HashMap<String, ModelRing>>,
}

impl Default for CredentialPoolSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialPoolSelector {
    pub fn new() -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotently extend `model_id`'s ring with `credential_ids`,
    /// recording `owner_tag` the first time the model is seen (or
    /// updating it later if a non-empty tag is supplied).
    pub fn register(&self, model_ids: &[String], credential_ids: &[String], owner_tag: &str) {
        let mut models = self.models.lock().expect("selector mutex poisoned");
        for model_id in model_ids {
            let entry = models.entry(model_id.clone()).or_default();
            if !owner_tag.is_empty() {
                entry.owner_tag = owner_tag.to_string();
            }
            for credential_id in credential_ids {
                if !entry.contains(credential_id) {
                    entry.ring.push(credential_id.clone());
                }
            }
        }
    }

    /// Lease a credential for `model_id`, or `None` if every entry in
    /// the ring is currently in-use or within its skip window.
    ///
    /// Scans at most `ring.len()` positions starting from the cursor,
    /// advancing the cursor on every step regardless of outcome.
    pub fn acquire(&self, model_id: &str) -> Option<String> {
        let mut models = self.models.lock().expect("selector mutex poisoned");
        let ring = models.get_mut(model_id)?;
        let len = ring.ring.len();
        if len == 0 {
            return None;
        }

        let now = Instant::now();
        for _ in 0..len {
            let idx = ring.cursor % len;
            ring.cursor = (ring.cursor + 1) % len;
            let candidate = ring.ring[idx].clone();

            if ring.in_use.contains(&candidate) {
                continue;
            }
            if let Some(until) = ring.skip_until.get(&candidate) {
                if *until > now {
                    continue;
                }
            }

            ring.in_use.insert(candidate.clone());
            return Some(candidate);
        }

        None
    }

    /// Lease the first entry of `ranked` (already ordered by the
    /// caller) that is neither `inUse` nor within its skip window.
    /// Unlike [`Self::acquire`], the ring/cursor is never touched —
    /// callers that compute their own candidate order (Grok's quota
    /// ranking) bypass round-robin scanning while still sharing the
    /// same `inUse`/skip bookkeeping and locking.
    pub fn acquire_ranked(&self, model_id: &str, ranked: &[String]) -> Option<String> {
        let mut models = self.models.lock().expect("selector mutex poisoned");
        let ring = models.entry(model_id.to_string()).or_default();
        let now = Instant::now();

        for candidate in ranked {
            if ring.in_use.contains(candidate) {
                continue;
            }
            if let Some(until) = ring.skip_until.get(candidate) {
                if *until > now {
                    continue;
                }
            }
            ring.in_use.insert(candidate.clone());
            return Some(candidate.clone());
        }
        None
    }

    /// Clear the `in_use` flag for `credential_id` across every model
    /// ring it participates in. Idempotent.
    pub fn release(&self, credential_id: &str) {
        let mut models = self.models.lock().expect("selector mutex poisoned");
        for ring in models.values_mut() {
            ring.in_use.remove(credential_id);
        }
    }

    /// Set a cooldown window for `(model_id, credential_id)`.
    pub fn skip(&self, model_id: &str, credential_id: &str, duration_ms: Option<u64>) {
        let mut models = self.models.lock().expect("selector mutex poisoned");
        if let Some(ring) = models.get_mut(model_id) {
            let duration = Duration::from_millis(duration_ms.unwrap_or(DEFAULT_SKIP_MS));
            ring.skip_until
                .insert(credential_id.to_string(), Instant::now() + duration);
        }
    }

    /// Clear a skip window early, e.g. after a successful request.
    pub fn clear_skip(&self, model_id: &str, credential_id: &str) {
        let mut models = self.models.lock().expect("selector mutex poisoned");
        if let Some(ring) = models.get_mut(model_id) {
            ring.skip_until.remove(credential_id);
        }
    }

    pub fn owner_tag(&self, model_id: &str) -> Option<String> {
        let models = self.models.lock().expect("selector mutex poisoned");
        models.get(model_id).map(|r| r.owner_tag.clone())
    }

    pub fn ring_size(&self, model_id: &str) -> usize {
        let models = self.models.lock().expect("selector mutex poisoned");
        models.get(model_id).map(|r| r.ring.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(vals: &[&str]) -> Vec<String> {
        vals.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn register_is_idempotent() {
        let pool = CredentialPoolSelector::new();
        pool.register(&ids(&["m"]), &ids(&["a", "b"]), "deepseek");
        pool.register(&ids(&["m"]), &ids(&["a", "b"]), "deepseek");
        assert_eq!(pool.ring_size("m"), 2);
    }

    #[test]
    fn acquire_then_release_allows_reacquire() {
        let pool = CredentialPoolSelector::new();
        pool.register(&ids(&["m"]), &ids(&["a"]), "deepseek");
        let got = pool.acquire("m").unwrap();
        assert_eq!(got, "a");
        assert!(pool.acquire("m").is_none(), "in-use credential must not be handed out twice");
        pool.release(&got);
        assert_eq!(pool.acquire("m").unwrap(), "a");
    }

    #[test]
    fn acquire_exhausts_ring_and_returns_null() {
        let pool = CredentialPoolSelector::new();
        pool.register(&ids(&["m"]), &ids(&["a", "b"]), "deepseek");
        pool.acquire("m");
        pool.acquire("m");
        assert!(pool.acquire("m").is_none());
    }

    #[test]
    fn skip_window_excludes_until_expiry() {
        let pool = CredentialPoolSelector::new();
        pool.register(&ids(&["m"]), &ids(&["x", "y"]), "grok");
        let x = pool.acquire("m").unwrap();
        pool.release(&x);
        pool.skip("m", &x, Some(50));

        let got = pool.acquire("m").unwrap();
        assert_eq!(got, "y", "skipped credential must be passed over");
        pool.release(&got);

        std::thread::sleep(Duration::from_millis(80));
        let got = pool.acquire("m").unwrap();
        assert_eq!(got, "x", "skip window must expire");
    }

    #[test]
    fn acquire_ranked_honors_caller_order_and_in_use() {
        let pool = CredentialPoolSelector::new();
        let ranked = ids(&["best", "second"]);
        let got = pool.acquire_ranked("grok-4", &ranked).unwrap();
        assert_eq!(got, "best");

        let got2 = pool.acquire_ranked("grok-4", &ranked).unwrap();
        assert_eq!(got2, "second", "in-use entries must be skipped even off-ring");

        assert!(pool.acquire_ranked("grok-4", &ranked).is_none());

        pool.release(&got);
        assert_eq!(pool.acquire_ranked("grok-4", &ranked).unwrap(), "best");
    }

    #[test]
    fn owner_tag_is_recorded_on_first_registration() {
        let pool = CredentialPoolSelector::new();
        pool.register(&ids(&["m"]), &ids(&["a"]), "deepseek");
        pool.register(&ids(&["m"]), &ids(&["b"]), "");
        assert_eq!(pool.owner_tag("m").as_deref(), Some("deepseek"));
    }
}
