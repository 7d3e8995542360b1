// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::schema::Config;

const ENCRYPT_PREFIX: &str = "$encrypt$";

/// Load `config.yaml` from `path`, or `./config.yaml` if not given.
///
/// A missing or unparsable file is a fatal error — the caller is
/// expected to propagate it straight into a nonzero process exit, per
/// the "failure to load config terminates the process" contract.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config file {}", path.display()))?;

    let mut config: Config = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;

    if encrypt_admin_password(&mut config) {
        info!(path = %path.display(), "rewriting config with encrypted admin password");
        let yaml = serde_yaml::to_string(&config).context("serializing config for rewrite")?;
        std::fs::write(&path, yaml)
            .with_context(|| format!("writing config file {}", path.display()))?;
    }

    Ok(config)
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("config.yaml")
}

/// Replace the admin password in the config file with `new_password`,
/// stored in the hashed `$encrypt$` form.
pub fn regenerate_admin_password(path: Option<&Path>, new_password: &str) -> anyhow::Result<()> {
    let path = path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let mut config: Config = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;

    config.admin.password = new_password.to_string();
    encrypt_admin_password(&mut config);

    let yaml = serde_yaml::to_string(&config).context("serializing config")?;
    std::fs::write(&path, yaml)
        .with_context(|| format!("writing config file {}", path.display()))?;
    Ok(())
}

/// If `admin.password` is plaintext (doesn't start with `$encrypt$`),
/// hash it in place and return `true` so the caller rewrites the file.
///
/// This is a known-weak, unsalted scheme kept only for compatibility
/// with existing config files; do not rely on it for new deployments.
fn encrypt_admin_password(config: &mut Config) -> bool {
    let pw = &config.admin.password;
    if pw.is_empty() || pw.starts_with(ENCRYPT_PREFIX) {
        return false;
    }
    let hash = hex::encode(Sha256::digest(pw.as_bytes()));
    config.admin.password = format!("{ENCRYPT_PREFIX}{hash}");
    true
}

/// Verify a plaintext password against the stored (possibly
/// already-encrypted) admin password value.
pub fn verify_admin_password(config: &Config, provided: &str) -> bool {
    let stored = &config.admin.password;
    match stored.strip_prefix(ENCRYPT_PREFIX) {
        Some(hash_hex) => hex::encode(Sha256::digest(provided.as_bytes())) == hash_hex,
        None => stored == provided,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AdminConfig;

    fn minimal_config(password: &str) -> Config {
        Config {
            admin: AdminConfig {
                username: "admin".into(),
                password: password.into(),
            },
            keys: vec!["k1".into()],
            projects: Default::default(),
            grok: Default::default(),
        }
    }

    #[test]
    fn plaintext_password_gets_encrypted() {
        let mut cfg = minimal_config("hunter2");
        assert!(encrypt_admin_password(&mut cfg));
        assert!(cfg.admin.password.starts_with(ENCRYPT_PREFIX));
    }

    #[test]
    fn already_encrypted_password_is_left_alone() {
        let mut cfg = minimal_config("$encrypt$deadbeef");
        assert!(!encrypt_admin_password(&mut cfg));
        assert_eq!(cfg.admin.password, "$encrypt$deadbeef");
    }

    #[test]
    fn verify_admin_password_roundtrip() {
        let mut cfg = minimal_config("hunter2");
        encrypt_admin_password(&mut cfg);
        assert!(verify_admin_password(&cfg, "hunter2"));
        assert!(!verify_admin_password(&cfg, "wrong"));
    }

    #[test]
    fn regenerate_admin_password_rewrites_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "admin:\n  username: admin\n  password: old\nkeys: []\n").unwrap();

        regenerate_admin_password(Some(&path), "newpass").unwrap();

        let config = load(Some(&path)).unwrap();
        assert!(verify_admin_password(&config, "newpass"));
        assert!(!verify_admin_password(&config, "old"));
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load(Some(&dir.path().join("nope.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_valid_file_encrypts_and_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "admin:\n  username: admin\n  password: plain\nkeys:\n  - k1\n",
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert!(config.admin.password.starts_with(ENCRYPT_PREFIX));

        let reloaded_text = std::fs::read_to_string(&path).unwrap();
        assert!(reloaded_text.contains(ENCRYPT_PREFIX));
    }
}
