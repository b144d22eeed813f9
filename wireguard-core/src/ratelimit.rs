//! Cookie-based DoS mitigation (spec §4.7, §3 "Cookie reply"). Two
//! independent rate limits apply: a per-source-address bucket (so one
//! address can't force a cookie reply more than 4 times a second) and
//! a global bucket (so a distributed flood still gets throttled even
//! though every individual source looks fine on its own).

use std::net::IpAddr;
use std::time::Instant;

use rand_core::{CryptoRng, RngCore};
use wireguard_crypto::CookieSecret;
use wireguard_types::Cookie;
use wireguard_utils::{RandomizedState, TokenBucket};

/// One cookie reply per quarter second per source (spec §4.7).
const PER_SOURCE_WINDOW_TICKS: u64 = 1;
const PER_SOURCE_CAPACITY: u32 = 1;

/// A generous global ceiling so a single slow source can't starve
/// everyone else, without hand-tuning per deployment.
const GLOBAL_CAPACITY: u32 = 10_000;
const GLOBAL_WINDOW_TICKS: u64 = 1;

pub struct RateLimiter {
    secret: CookieSecret,
    secret_born: Instant,
    global: TokenBucket,
    per_source: std::collections::HashMap<IpAddr, TokenBucket, RandomizedState>,
}

/// How often `CookieSecret` is rotated (spec §4.7: "refreshed every
/// 120s by the caller").
const SECRET_ROTATION_SECS: u64 = 120;

impl RateLimiter {
    pub fn new(rng: &mut (impl CryptoRng + RngCore)) -> Self {
        let mut secret = CookieSecret::default();
        secret.regenerate(rng);
        Self {
            secret,
            secret_born: Instant::now(),
            global: TokenBucket::new(GLOBAL_CAPACITY, GLOBAL_WINDOW_TICKS),
            per_source: std::collections::HashMap::with_hasher(RandomizedState::new(rng)),
        }
    }

    pub fn maybe_rotate_secret(&mut self, rng: &mut (impl CryptoRng + RngCore), now: Instant) {
        if now.duration_since(self.secret_born).as_secs() >= SECRET_ROTATION_SECS {
            self.secret.regenerate(rng);
            self.secret_born = now;
        }
    }

    /// Returns `true` when the caller is currently under enough load
    /// that mac2/cookie verification should be enforced (spec §4.3's
    /// "overloaded" flag passed to `HasMac::verify`). Checking load is
    /// separate from consuming a reply slot: many messages can be
    /// accepted while overloaded as long as they carry a valid cookie.
    pub fn overloaded(&self, now_ticks: u64) -> bool {
        self.global.would_reject(now_ticks)
    }

    /// Attempts to consume one reply slot for `source`, trying the
    /// per-source bucket first since it's the cheaper rejection path.
    pub fn try_reply(&mut self, source: IpAddr, now_ticks: u64) -> bool {
        let bucket = self
            .per_source
            .entry(source)
            .or_insert_with(|| TokenBucket::new(PER_SOURCE_CAPACITY, PER_SOURCE_WINDOW_TICKS));
        if !bucket.try_acquire(now_ticks) {
            return false;
        }
        self.global.try_acquire(now_ticks)
    }

    pub fn cookie_for(&self, addr: std::net::SocketAddr) -> Cookie {
        self.secret.cookie_for(addr)
    }

    /// Drops stale per-source buckets so the table doesn't grow
    /// unbounded under a spoofed-source flood; called periodically by
    /// the device's timer thread.
    pub fn evict_idle(&mut self, now_ticks: u64, idle_ticks: u64) {
        self.per_source
            .retain(|_, bucket| !bucket.idle_since(now_ticks, idle_ticks));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn per_source_limit_allows_one_per_window_then_blocks() {
        let mut rl = RateLimiter::new(&mut OsRng);
        let addr: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(rl.try_reply(addr, 0));
        assert!(!rl.try_reply(addr, 0));
        assert!(rl.try_reply(addr, 1));
    }

    #[test]
    fn distinct_sources_do_not_share_a_bucket() {
        let mut rl = RateLimiter::new(&mut OsRng);
        let a: IpAddr = "203.0.113.5".parse().unwrap();
        let b: IpAddr = "203.0.113.6".parse().unwrap();
        assert!(rl.try_reply(a, 0));
        assert!(rl.try_reply(b, 0));
    }
}
