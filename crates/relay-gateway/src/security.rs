// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Security headers and per-IP failure rate limiting.
//!
//! Headers are appended to every response unconditionally, and rate
//! limiting is charged only against *failed* auth attempts so
//! well-behaved clients never trip it on their own traffic. Loopback
//! callers are exempt: a process with loopback access already has
//! local access to the machine.

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};

static NO_SNIFF: HeaderValue = HeaderValue::from_static("nosniff");
static DENY_FRAME: HeaderValue = HeaderValue::from_static("DENY");
static NO_REFERRER: HeaderValue = HeaderValue::from_static("no-referrer");
static PERMISSIONS: HeaderValue =
    HeaderValue::from_static("camera=(), microphone=(), geolocation=()");

/// Append security headers to every outgoing response.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let h = resp.headers_mut();
    h.insert(axum::http::header::X_CONTENT_TYPE_OPTIONS, NO_SNIFF.clone());
    h.insert(axum::http::header::X_FRAME_OPTIONS, DENY_FRAME.clone());
    h.insert(axum::http::header::REFERRER_POLICY, NO_REFERRER.clone());
    h.insert("permissions-policy", PERMISSIONS.clone());
    resp
}

pub type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// Keyed-by-IP limiter charged only on failed auth attempts.
pub struct FailureLimiter {
    limiter: IpLimiter,
}

impl FailureLimiter {
    /// `max_per_minute` failures before lockout, `burst` allowed before
    /// the limit engages.
    pub fn new(max_per_minute: u32, burst: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(max_per_minute).expect("max_per_minute must be > 0"))
            .allow_burst(NonZeroU32::new(burst).expect("burst must be > 0"));
        Self {
            limiter: RateLimiter::keyed(quota),
        }
    }

    /// Record a failed attempt from `ip`. Returns `false` once the
    /// caller should be locked out. Loopback is always allowed.
    pub fn record_failure(&self, ip: IpAddr) -> bool {
        if is_loopback(ip) {
            return true;
        }
        self.limiter.check_key(&ip).is_ok()
    }
}

pub fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_v4_is_loopback() {
        assert!(is_loopback(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn non_loopback_is_not_loopback() {
        assert!(!is_loopback("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn loopback_never_locks_out() {
        let limiter = FailureLimiter::new(1, 1);
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        for _ in 0..10 {
            assert!(limiter.record_failure(ip));
        }
    }

    #[test]
    fn repeated_failures_eventually_lock_out_non_loopback() {
        let limiter = FailureLimiter::new(5, 1);
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let mut saw_lockout = false;
        for _ in 0..20 {
            if !limiter.record_failure(ip) {
                saw_lockout = true;
                break;
            }
        }
        assert!(saw_lockout, "rate limiter never engaged");
    }
}
