//! A configured peer: its identity, endpoint, routing, and the
//! handshake/keypair/timer state that tracks one ongoing conversation
//! with it (spec §3 "Peer", "Handshake").

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use ipnet::IpNet;
use wireguard_crypto::{HandshakeState, PeerCookie, StaticPeerConfig};
use x25519_dalek::StaticSecret;

use crate::session::KeypairSlots;
use crate::timers::PeerTimers;

/// Default bound on the outbound staging queue (spec §4.6: "default
/// 1024").
pub const DEFAULT_STAGING_QUEUE_CAPACITY: usize = 1024;

/// Per-peer counters surfaced over IPC (spec §4.8) and used to decide
/// whether a log line is worth the rate limit budget.
#[derive(Default, Clone, Copy)]
pub struct Counters {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub rx_replay_drops: u64,
    pub rx_auth_failures: u64,
}

/// Mirrors spec §3's "Handshake" state enum; `InFlight` carries the
/// transcript state plus the ephemeral secret the transcript was built
/// against, which is needed to process the eventual response.
pub enum HandshakeSlot {
    Zeroed,
    CreatedInitiation {
        state: HandshakeState,
        ephemeral_secret: StaticSecret,
        our_index: u32,
        started_at: Instant,
    },
    ConsumedInitiation {
        state: HandshakeState,
        their_index: u32,
    },
}

impl Default for HandshakeSlot {
    fn default() -> Self {
        HandshakeSlot::Zeroed
    }
}

/// A queued, not-yet-encrypted outbound IP frame.
pub struct StagedFrame {
    pub payload: Vec<u8>,
}

pub struct Peer {
    pub config: StaticPeerConfig,
    /// DH(our static, their static), precomputed at configuration time
    /// (spec §4: "the caller supplies it... precomputed at
    /// peer-configuration time") so handshake processing never does a
    /// scalar multiplication on the hot path.
    pub precomputed_ss: [u8; 32],
    pub cookie: PeerCookie,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<std::time::Duration>,
    pub counters: Counters,
    pub handshake: HandshakeSlot,
    pub keypairs: KeypairSlots,
    pub staging: VecDeque<StagedFrame>,
    pub staging_capacity: usize,
    pub timers: PeerTimers,
    pub last_handshake_completed: Option<Instant>,
    pub last_sent: Option<Instant>,
    pub last_received: Option<Instant>,
    /// TAI64N of the last accepted initiation from this peer, for the
    /// strictly-greater replay check (spec §4.3).
    pub last_initiation_timestamp: Option<tai64::Tai64N>,
}

impl Peer {
    pub fn new(config: StaticPeerConfig, precomputed_ss: [u8; 32]) -> Self {
        Self {
            config,
            precomputed_ss,
            cookie: PeerCookie::default(),
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: None,
            counters: Counters::default(),
            handshake: HandshakeSlot::Zeroed,
            keypairs: KeypairSlots::new(),
            staging: VecDeque::new(),
            staging_capacity: DEFAULT_STAGING_QUEUE_CAPACITY,
            timers: PeerTimers::new(),
            last_handshake_completed: None,
            last_sent: None,
            last_received: None,
            last_initiation_timestamp: None,
        }
    }

    /// Stages a frame for transmission, dropping the oldest queued
    /// frame on overflow (spec §4.6: "oldest dropped on overflow").
    pub fn stage(&mut self, payload: Vec<u8>) {
        if self.staging.len() >= self.staging_capacity {
            self.staging.pop_front();
        }
        self.staging.push_back(StagedFrame { payload });
    }

    pub fn has_usable_keypair(&self, now: Instant) -> bool {
        self.keypairs.current().is_some_and(|kp| kp.usable_for_send(now))
    }

    pub fn handshake_in_flight(&self) -> bool {
        matches!(self.handshake, HandshakeSlot::CreatedInitiation { .. })
    }

    /// Accepts a strictly-greater handshake timestamp, updating the
    /// stored high-water mark; rejects (and leaves state untouched)
    /// otherwise (spec §4.3's monotone-per-peer replay defense).
    pub fn accept_initiation_timestamp(&mut self, ts: tai64::Tai64N) -> bool {
        match self.last_initiation_timestamp {
            Some(prev) if ts <= prev => false,
            _ => {
                self.last_initiation_timestamp = Some(ts);
                true
            }
        }
    }

    pub fn on_data_sent(&mut self, now: Instant, bytes: u64) {
        self.last_sent = Some(now);
        self.counters.tx_bytes += bytes;
        self.timers.on_data_sent(now);
    }

    pub fn on_data_received(&mut self, now: Instant, bytes: u64) {
        self.last_received = Some(now);
        self.counters.rx_bytes += bytes;
        self.timers.on_data_received(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use x25519_dalek::{PublicKey, StaticSecret as Sk};

    fn dummy_peer() -> Peer {
        let sk = Sk::random_from_rng(OsRng);
        let pk = PublicKey::from(&sk);
        Peer::new(StaticPeerConfig::new(pk, None), [0; 32])
    }

    #[test]
    fn staging_drops_oldest_on_overflow() {
        let mut peer = dummy_peer();
        peer.staging_capacity = 2;
        peer.stage(vec![1]);
        peer.stage(vec![2]);
        peer.stage(vec![3]);
        assert_eq!(peer.staging.len(), 2);
        assert_eq!(peer.staging.front().unwrap().payload, vec![2]);
    }

    #[test]
    fn initiation_timestamp_must_strictly_increase() {
        let mut peer = dummy_peer();
        let t1 = tai64::Tai64N::now();
        assert!(peer.accept_initiation_timestamp(t1));
        assert!(!peer.accept_initiation_timestamp(t1));
    }
}
