// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Source-address cookies for handshake load shedding.
//!
//! Under load the responder answers the first handshake message with a
//! cookie instead of doing X25519 work. The cookie binds the client's source
//! address to a rotating secret, so a spoofing flood cannot force key
//! agreement and a legitimate client only pays one extra round trip.

use core::net::IpAddr;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use subtle::ConstantTimeEq;

/// `[expires_unix:8 BE][mac:16]`
pub const COOKIE_LEN: usize = 8 + MAC_LEN;

const MAC_LEN: usize = 16;
const SECRET_LEN: usize = 32;

/// Default cookie lifetime; the secret rotates on the same cadence
pub const DEFAULT_COOKIE_TTL: Duration = Duration::from_secs(120);

/// Whether the responder is under enough pressure to demand cookies
pub trait LoadMonitor: Send + Sync {
    fn high_load(&self) -> bool;
}

/// Issues and verifies source-address cookies.
///
/// Verification accepts the current secret and the one before it, so a
/// rotation never invalidates cookies already in flight.
pub struct CookieManager {
    secrets: RwLock<Secrets>,
    ttl: Duration,
}

struct Secrets {
    current: [u8; SECRET_LEN],
    previous: Option<[u8; SECRET_LEN]>,
}

impl CookieManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            secrets: RwLock::new(Secrets {
                current: random_secret(),
                previous: None,
            }),
            ttl,
        }
    }

    /// Issues a cookie for `source`, valid for the configured ttl
    pub fn issue(&self, source: IpAddr) -> [u8; COOKIE_LEN] {
        let expires = unix_now() + self.ttl.as_secs();
        let secrets = self.secrets.read();
        let mac = compute_mac(&secrets.current, source, expires);

        let mut cookie = [0u8; COOKIE_LEN];
        cookie[..8].copy_from_slice(&expires.to_be_bytes());
        cookie[8..].copy_from_slice(&mac);
        cookie
    }

    /// Whether `cookie` is fresh and was issued to `source`
    pub fn verify(&self, source: IpAddr, cookie: &[u8]) -> bool {
        let Ok(cookie) = <&[u8; COOKIE_LEN]>::try_from(cookie) else {
            return false;
        };
        let expires = u64::from_be_bytes(cookie[..8].try_into().expect("prefix length is fixed"));
        if expires < unix_now() {
            return false;
        }
        let mac: &[u8; MAC_LEN] = cookie[8..].try_into().expect("suffix length is fixed");

        let secrets = self.secrets.read();
        let mut valid = compute_mac(&secrets.current, source, expires)[..].ct_eq(mac);
        if let Some(previous) = &secrets.previous {
            valid |= compute_mac(previous, source, expires)[..].ct_eq(mac);
        }
        valid.into()
    }

    /// Replaces the signing secret, keeping the old one for verification.
    ///
    /// Run on the same cadence as the ttl.
    pub fn rotate(&self) {
        let mut secrets = self.secrets.write();
        secrets.previous = Some(secrets.current);
        secrets.current = random_secret();
    }

    #[inline]
    pub fn rotation_period(&self) -> Duration {
        self.ttl
    }
}

fn random_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    secret
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_secs()
}

fn compute_mac(secret: &[u8; SECRET_LEN], source: IpAddr, expires: u64) -> [u8; MAC_LEN] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    match source {
        IpAddr::V4(v4) => mac.update(&v4.octets()),
        IpAddr::V6(v6) => mac.update(&v6.octets()),
    }
    mac.update(&expires.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    digest[..MAC_LEN]
        .try_into()
        .expect("digest is longer than the mac")
}

/// Load monitor backed by a gauge of handshakes currently in progress
pub struct InFlightHandshakes {
    active: AtomicUsize,
    threshold: usize,
}

impl InFlightHandshakes {
    pub fn new(threshold: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            threshold,
        }
    }

    /// Accounts one handshake for as long as the guard lives
    pub fn begin(&self) -> InFlightGuard<'_> {
        self.active.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { gauge: self }
    }

    #[inline]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

impl LoadMonitor for InFlightHandshakes {
    #[inline]
    fn high_load(&self) -> bool {
        self.active.load(Ordering::Relaxed) >= self.threshold
    }
}

pub struct InFlightGuard<'a> {
    gauge: &'a InFlightHandshakes,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: IpAddr = IpAddr::V4(core::net::Ipv4Addr::new(198, 51, 100, 7));

    #[test]
    fn issued_cookies_verify_for_the_same_source() {
        let manager = CookieManager::new(DEFAULT_COOKIE_TTL);
        let cookie = manager.issue(SOURCE);
        assert!(manager.verify(SOURCE, &cookie));
    }

    #[test]
    fn cookies_are_bound_to_the_source_address() {
        let manager = CookieManager::new(DEFAULT_COOKIE_TTL);
        let cookie = manager.issue(SOURCE);
        let other = IpAddr::V4(core::net::Ipv4Addr::new(198, 51, 100, 8));
        assert!(!manager.verify(other, &cookie));
    }

    #[test]
    fn tampered_cookies_fail() {
        let manager = CookieManager::new(DEFAULT_COOKIE_TTL);
        let mut cookie = manager.issue(SOURCE);
        cookie[COOKIE_LEN - 1] ^= 1;
        assert!(!manager.verify(SOURCE, &cookie));

        // extending the expiry invalidates the mac
        let mut cookie = manager.issue(SOURCE);
        cookie[..8].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(!manager.verify(SOURCE, &cookie));
    }

    #[test]
    fn wrong_lengths_fail_without_panicking() {
        let manager = CookieManager::new(DEFAULT_COOKIE_TTL);
        assert!(!manager.verify(SOURCE, &[]));
        assert!(!manager.verify(SOURCE, &[0u8; COOKIE_LEN - 1]));
        assert!(!manager.verify(SOURCE, &[0u8; COOKIE_LEN + 1]));
    }

    #[test]
    fn one_rotation_keeps_inflight_cookies_valid() {
        let manager = CookieManager::new(DEFAULT_COOKIE_TTL);
        let cookie = manager.issue(SOURCE);
        manager.rotate();
        assert!(manager.verify(SOURCE, &cookie));
        manager.rotate();
        assert!(!manager.verify(SOURCE, &cookie));
    }

    #[test]
    fn load_gauge_trips_at_the_threshold() {
        let gauge = InFlightHandshakes::new(2);
        assert!(!gauge.high_load());
        let first = gauge.begin();
        assert!(!gauge.high_load());
        let second = gauge.begin();
        assert!(gauge.high_load());
        drop(first);
        assert!(!gauge.high_load());
        drop(second);
        assert_eq!(gauge.active(), 0);
    }
}
