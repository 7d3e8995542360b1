// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Configuration loading for the relay gateway.
//!
//! A single `config.yaml` at the working directory, loaded once at
//! boot. Parsing failure is fatal — see [`load`].

mod loader;
mod schema;

pub use loader::{default_config_path, load, regenerate_admin_password, verify_admin_password};
pub use schema::{AdminConfig, Config, GrokConfig, ImageMode, ProjectConfig};
