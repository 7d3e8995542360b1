// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Public model catalog synthesized from per-provider model tables,
//! plus the runtime registry of `(model id → owner tag)` populated at
//! startup. Registration is a plain function call made once during
//! boot; nothing is discovered dynamically.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Static metadata for one upstream driver family.
#[derive(Debug, Clone, Copy)]
pub struct DriverMeta {
    pub owner_tag: &'static str,
    pub model_ids: &'static [&'static str],
    /// Reserved slots (Claude/Kimi) are listed in the catalog but have
    /// no adapter registered; requests against them fail with 503
    /// ("no account available") rather than 404, matching how an
    /// unregistered-but-known model behaves under the selector.
    pub reserved: bool,
}

pub const DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        owner_tag: "deepseek",
        model_ids: &[
            "deepseek-chat",
            "deepseek-reasoner",
            "deepseek-chat-search",
            "deepseek-reasoner-search",
        ],
        reserved: false,
    },
    DriverMeta {
        owner_tag: "grok",
        model_ids: &[
            "grok-3",
            "grok-3-fast",
            "grok-3-mini",
            "grok-3-mini-fast",
            "grok-4",
            "grok-4-fast",
            "grok-4-heavy",
            "grok-imagine-0.9",
        ],
        reserved: false,
    },
    DriverMeta {
        owner_tag: "claude",
        model_ids: &["claude-3-7-sonnet", "claude-opus-4"],
        reserved: true,
    },
    DriverMeta {
        owner_tag: "kimi",
        model_ids: &["kimi-k2"],
        reserved: true,
    },
];

pub fn list_drivers() -> &'static [DriverMeta] {
    DRIVERS
}

pub fn driver_for_model(model_id: &str) -> Option<&'static DriverMeta> {
    DRIVERS.iter().find(|d| d.model_ids.contains(&model_id))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalogEntry {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: String,
}

/// `GET /v1/models` catalog, synthesized from [`DRIVERS`] excluding
/// reserved (unimplemented) slots.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    let created = Utc::now().timestamp();
    DRIVERS
        .iter()
        .filter(|d| !d.reserved)
        .flat_map(|d| {
            d.model_ids.iter().map(move |id| ModelCatalogEntry {
                id: id.to_string(),
                object: "model",
                created,
                owned_by: d.owner_tag.to_string(),
            })
        })
        .collect()
}

/// Runtime `(model id → owner tag)` map populated by provider
/// registration at startup; unique by `modelId`.
#[derive(Default)]
pub struct ModelRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

struct RegistryEntry {
    owner_tag: String,
    created_at: i64,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, model_id: &str, owner_tag: &str) {
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        entries
            .entry(model_id.to_string())
            .or_insert_with(|| RegistryEntry {
                owner_tag: owner_tag.to_string(),
                created_at: Utc::now().timestamp(),
            });
    }

    pub fn owner_tag(&self, model_id: &str) -> Option<String> {
        let entries = self.entries.lock().expect("registry mutex poisoned");
        entries.get(model_id).map(|e| e.owner_tag.clone())
    }

    pub fn known_model_ids(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("registry mutex poisoned");
        entries.keys().cloned().collect()
    }
}
