// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process-wide stateful subsystems shared by every provider adapter:
//! the token-file cache, the credential repository, the credential
//! pool selector, and the egress proxy pool.

mod cache;
mod credential;
mod proxy;
mod selector;

pub use cache::TokenFileCache;
pub use credential::{
    delete_credential, save_credential, CredentialFile, GrokTokenEntry, GrokTokenStore,
};
pub use proxy::{fetch_pool_proxy, normalize_scheme, ProxyConfig, ProxyPool};
pub use selector::CredentialPoolSelector;
