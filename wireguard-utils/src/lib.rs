//! Small helpers shared by the crypto core and the device orchestrator
//! that don't deserve their own crate: a randomized hasher for tables
//! keyed by attacker-observable bytes (public keys, receiver indices),
//! and a saturating rate-window counter used by the rate limiter.

use core::hash::BuildHasher;

use ahash::RandomState;
use rand_core::RngCore;

/// A `BuildHasher` seeded from a CSPRNG at construction time. Hash maps
/// keyed by peer public keys or wire-supplied indices use this instead
/// of the default hasher so an off-path attacker who can guess inputs
/// can't engineer hash-flooding collisions against a fixed seed.
#[derive(Clone)]
pub struct RandomizedState(RandomState);

impl RandomizedState {
    pub fn new(rng: &mut impl RngCore) -> Self {
        let seeds: [u64; 4] = core::array::from_fn(|_| rng.next_u64());
        Self(RandomState::with_seeds(seeds[0], seeds[1], seeds[2], seeds[3]))
    }
}

impl BuildHasher for RandomizedState {
    type Hasher = ahash::AHasher;

    fn build_hasher(&self) -> Self::Hasher {
        self.0.build_hasher()
    }
}

/// A fixed-capacity, fixed-duration token bucket: `cap` tokens refill
/// fully every `window`. Used by the cookie-reply rate limiter (spec
/// §4.7) and, generically, anywhere else a coarse global cap is needed.
pub struct TokenBucket {
    capacity: u32,
    remaining: u32,
    window_start: u64,
    window_ticks: u64,
}

impl TokenBucket {
    pub fn new(capacity: u32, window_ticks: u64) -> Self {
        Self {
            capacity,
            remaining: capacity,
            window_start: 0,
            window_ticks,
        }
    }

    /// `now_ticks` is any monotonically increasing counter (e.g.
    /// milliseconds since device start). Returns `true` if a token was
    /// available and has been consumed.
    pub fn try_acquire(&mut self, now_ticks: u64) -> bool {
        if now_ticks.saturating_sub(self.window_start) >= self.window_ticks {
            self.window_start = now_ticks;
            self.remaining = self.capacity;
        }
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Non-consuming peek: would the bucket currently refuse a draw,
    /// without rolling its window forward? Used to answer "are we
    /// overloaded" independently of "can this specific reply proceed".
    pub fn would_reject(&self, now_ticks: u64) -> bool {
        let refilled = now_ticks.saturating_sub(self.window_start) >= self.window_ticks;
        !refilled && self.remaining == 0
    }

    /// True if the bucket hasn't been drawn from for at least
    /// `idle_ticks`, for callers that want to evict long-unused
    /// per-key buckets from a map.
    pub fn idle_since(&self, now_ticks: u64, idle_ticks: u64) -> bool {
        now_ticks.saturating_sub(self.window_start) >= idle_ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_refills_per_window() {
        let mut bucket = TokenBucket::new(2, 1000);
        assert!(bucket.try_acquire(0));
        assert!(bucket.try_acquire(0));
        assert!(!bucket.try_acquire(0));
        assert!(bucket.try_acquire(1000));
    }

    #[test]
    fn randomized_state_differs_across_instances() {
        use core::hash::Hasher;

        let mut rng = rand::rngs::OsRng;
        let a = RandomizedState::new(&mut rng);
        let b = RandomizedState::new(&mut rng);

        let mut ha = a.build_hasher();
        let mut hb = b.build_hasher();
        ha.write(b"some peer public key bytes");
        hb.write(b"some peer public key bytes");

        // Independently seeded states are (almost certainly) distinct,
        // so the same input hashes differently under each.
        assert_ne!(ha.finish(), hb.finish());
    }
}
