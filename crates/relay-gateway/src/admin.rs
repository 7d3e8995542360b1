// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Admin session table for the management surface.
//!
//! A session is a random 32-byte id, shown to the browser as the
//! cookie value and kept server-side only as its SHA-256 hash — the
//! same "never store the raw secret" convention the bearer-token file
//! uses. Sessions expire after a fixed TTL measured from creation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore;
use sha2::{Digest, Sha256};

const SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);
pub const SESSION_COOKIE_NAME: &str = "relay_session";

pub struct AdminSessions {
    sessions: Mutex<HashMap<String, Instant>>,
}

impl Default for AdminSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminSessions {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a new session, returning the raw cookie value.
    pub fn create(&self) -> String {
        let mut raw_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw_bytes);
        let raw = hex::encode(raw_bytes);

        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        sessions.insert(hash(&raw), Instant::now() + SESSION_TTL);
        raw
    }

    pub fn verify(&self, raw: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        let key = hash(raw);
        match sessions.get(&key) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                sessions.remove(&key);
                false
            }
            None => false,
        }
    }

    pub fn revoke(&self, raw: &str) {
        let mut sessions = self.sessions.lock().expect("session mutex poisoned");
        sessions.remove(&hash(raw));
    }
}

fn hash(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}
