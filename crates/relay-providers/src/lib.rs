// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider adapters: DeepSeek and Grok today, reserved registry
//! slots for Claude and Kimi.

pub mod deepseek;
pub mod deepseek_adapter;
pub mod grok;
pub mod grok_adapter;
pub mod media_cache;
pub mod mock;
pub mod pow;
pub mod provider;
pub mod registry;

pub use deepseek_adapter::{DeepSeekConfig, DeepSeekProvider};
pub use grok_adapter::GrokProvider;
pub use mock::ScriptedProvider;
pub use media_cache::MediaCache;
pub use provider::{AdapterError, HandleResult, HandleState, ModelProvider, ResponseStream};
pub use registry::{driver_for_model, list_drivers, static_catalog, DriverMeta, ModelCatalogEntry, ModelRegistry};
