//! The orchestrator (spec §3 "Device", §5 "Locking discipline"). A
//! single coarse-grained lock protects the peer table, index table,
//! and static key, exactly as spec §5 prescribes; peers and keypairs
//! manage their own finer-grained/lock-free state once looked up.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ipnet::IpNet;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tai64::Tai64N;
use wireguard_crypto::{
    decrypt_handshake_init, decrypt_handshake_resp, encrypt_handshake_init, encrypt_handshake_resp,
    HasMac, StaticInitiatorConfig, StaticPeerConfig,
};
use wireguard_tun::{Bind, Tun};
use wireguard_types::{
    HandshakeInit, HandshakeResp, MSG_COOKIE_REPLY, MSG_INITIATION, MSG_RESPONSE, MSG_TRANSPORT,
    TransportHeader, TRANSPORT_HEADER_LEN,
};
use wireguard_utils::RandomizedState;
use x25519_dalek::{PublicKey, StaticSecret};
use zerocopy::FromBytes;

use crate::allowed_ips::AllowedIps;
use crate::error::{DeviceError, IpcError};
use crate::index::{IndexPurpose, IndexTable, PeerId};
use crate::ipc;
use crate::peer::{HandshakeSlot, Peer};
use crate::pipeline::{self, DecryptJob, EncryptJob};
use crate::ratelimit::RateLimiter;
use crate::session::{Keypair, Role};
use crate::timers::TimerEvent;

/// What the caller should do after an inbound datagram has been
/// processed (spec §4.6's inbound pipeline outcomes).
pub enum InboundOutcome {
    Reply { datagram: Vec<u8>, to: SocketAddr },
    DeliverToTun { frame: Vec<u8> },
    Keepalive,
    Drop,
}

fn inner_src_addr(frame: &[u8]) -> Option<std::net::IpAddr> {
    match frame.first()? >> 4 {
        4 if frame.len() >= 16 => Some(std::net::IpAddr::V4(std::net::Ipv4Addr::new(
            frame[12], frame[13], frame[14], frame[15],
        ))),
        6 if frame.len() >= 24 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&frame[8..24]);
            Some(std::net::IpAddr::V6(std::net::Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn dest_addr(frame: &[u8]) -> Option<std::net::IpAddr> {
    match frame.first()? >> 4 {
        4 if frame.len() >= 20 => Some(std::net::IpAddr::V4(std::net::Ipv4Addr::new(
            frame[16], frame[17], frame[18], frame[19],
        ))),
        6 if frame.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&frame[24..40]);
            Some(std::net::IpAddr::V6(std::net::Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

pub struct DeviceConfig {
    pub private_key: StaticSecret,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
}

pub(crate) struct Inner {
    pub(crate) static_secret: StaticSecret,
    pub(crate) static_public: PublicKey,
    pub(crate) listen_port: Option<u16>,
    pub(crate) fwmark: Option<u32>,
    pub(crate) peers: Vec<Option<Peer>>,
    pub(crate) pubkey_index: HashMap<[u8; 32], PeerId, RandomizedState>,
    pub(crate) indices: IndexTable,
    pub(crate) allowed_ips: AllowedIps,
    pub(crate) rate_limiter: RateLimiter,
    bind: Option<Arc<dyn Bind>>,
    tun: Option<Arc<dyn Tun>>,
}

impl Inner {
    fn initiator_config(&self) -> StaticInitiatorConfig {
        StaticInitiatorConfig::new(self.static_secret.clone())
    }

    pub(crate) fn find_peer_mut(&mut self, key: &PublicKey) -> Option<(PeerId, &mut Peer)> {
        let id = *self.pubkey_index.get(key.as_bytes())?;
        self.peers[id].as_mut().map(|p| (id, p))
    }

    pub(crate) fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id).and_then(|p| p.as_mut())
    }
}

/// The device orchestrator. Every public method takes the coarse lock
/// for its duration; nothing here holds it across a blocking I/O call.
pub struct Device {
    inner: Mutex<Inner>,
    up: AtomicBool,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        let static_public = PublicKey::from(&config.private_key);
        Self {
            inner: Mutex::new(Inner {
                static_secret: config.private_key,
                static_public,
                listen_port: config.listen_port,
                fwmark: config.fwmark,
                peers: Vec::new(),
                pubkey_index: HashMap::with_hasher(RandomizedState::new(&mut OsRng)),
                indices: IndexTable::new(&mut OsRng),
                allowed_ips: AllowedIps::new(),
                rate_limiter: RateLimiter::new(&mut OsRng),
                bind: None,
                tun: None,
            }),
            up: AtomicBool::new(false),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.lock().static_public
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Binds the device to a transport and TUN (spec §4: fatal errors
    /// here propagate to the orchestrator and cause `Down`).
    pub fn up(&self, bind: Arc<dyn Bind>, tun: Arc<dyn Tun>) -> Result<(), DeviceError> {
        if self.up.swap(true, Ordering::AcqRel) {
            return Err(DeviceError::AlreadyUp);
        }
        let mut inner = self.inner.lock();
        inner.bind = Some(bind);
        inner.tun = Some(tun);
        Ok(())
    }

    /// Drains queues, zeroizes active keypairs, and releases the TUN
    /// and bind (spec §5 "Cancellation & shutdown").
    pub fn down(&self) {
        self.up.store(false, Ordering::Release);
        let mut inner = self.inner.lock();
        for peer in inner.peers.iter_mut().flatten() {
            peer.keypairs.clear();
            peer.staging.clear();
            peer.handshake = HandshakeSlot::Zeroed;
        }
        inner.bind = None;
        inner.tun = None;
    }

    pub fn bind(&self) -> Option<Arc<dyn Bind>> {
        self.inner.lock().bind.clone()
    }

    pub fn tun(&self) -> Option<Arc<dyn Tun>> {
        self.inner.lock().tun.clone()
    }

    pub fn add_peer(
        &self,
        public_key: PublicKey,
        preshared_key: Option<[u8; 32]>,
    ) -> Result<PeerId, DeviceError> {
        let mut inner = self.inner.lock();
        if public_key == inner.static_public {
            return Err(DeviceError::SelfPeer);
        }
        if inner.pubkey_index.contains_key(public_key.as_bytes()) {
            return Err(DeviceError::DuplicatePeer);
        }
        let ss = inner.static_secret.diffie_hellman(&public_key).to_bytes();
        let config = StaticPeerConfig::new(public_key, preshared_key);
        let peer = Peer::new(config, ss);
        let id = inner.peers.len();
        inner.peers.push(Some(peer));
        inner.pubkey_index.insert(*public_key.as_bytes(), id);
        Ok(id)
    }

    pub fn remove_peer(&self, public_key: &PublicKey) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        let id = *inner
            .pubkey_index
            .get(public_key.as_bytes())
            .ok_or(DeviceError::UnknownPeer)?;
        inner.pubkey_index.remove(public_key.as_bytes());
        inner.peers[id] = None;
        inner.indices.release_peer(id);
        inner.allowed_ips.remove_by_peer(id);
        Ok(())
    }

    pub fn set_peer_endpoint(&self, id: PeerId, endpoint: SocketAddr) {
        let mut inner = self.inner.lock();
        if let Some(peer) = inner.peer_mut(id) {
            peer.endpoint = Some(endpoint);
        }
    }

    pub fn set_peer_allowed_ips(&self, id: PeerId, nets: Vec<IpNet>) {
        let mut inner = self.inner.lock();
        inner.allowed_ips.remove_by_peer(id);
        for net in &nets {
            match net.addr() {
                std::net::IpAddr::V4(a) => inner.allowed_ips.insert_v4(a, net.prefix_len(), id),
                std::net::IpAddr::V6(a) => inner.allowed_ips.insert_v6(a, net.prefix_len(), id),
            }
        }
        if let Some(peer) = inner.peer_mut(id) {
            peer.allowed_ips = nets;
        }
    }

    pub fn apply_ipc_set(&self, body: &str) -> Result<(), IpcError> {
        ipc::apply_set(self, body)
    }

    pub fn render_ipc_get(&self) -> String {
        ipc::render_get(self)
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Applies the device-level fields of a `set=1` request (spec
    /// §4.8). `replace_peers` tears down every peer first, exactly as
    /// the real UAPI does before re-adding them.
    pub(crate) fn reconfigure(
        &self,
        private_key: Option<[u8; 32]>,
        listen_port: Option<u16>,
        fwmark: Option<u32>,
        replace_peers: bool,
    ) {
        let mut inner = self.inner.lock();
        if replace_peers {
            inner.peers.clear();
            inner.pubkey_index.clear();
            inner.allowed_ips = AllowedIps::new();
            inner.indices.clear();
        }
        if let Some(key) = private_key {
            let secret = StaticSecret::from(key);
            inner.static_public = PublicKey::from(&secret);
            inner.static_secret = secret;
        }
        if let Some(port) = listen_port {
            inner.listen_port = Some(port);
        }
        if let Some(mark) = fwmark {
            inner.fwmark = if mark == 0 { None } else { Some(mark) };
        }
    }

    pub(crate) fn peer_id_for(&self, public_key: &PublicKey) -> Option<PeerId> {
        self.inner.lock().pubkey_index.get(public_key.as_bytes()).copied()
    }

    pub(crate) fn update_peer(&self, id: PeerId, f: impl FnOnce(&mut Peer)) {
        let mut inner = self.inner.lock();
        if let Some(peer) = inner.peer_mut(id) {
            f(peer);
        }
    }

    pub(crate) fn peer_allowed_ips(&self, id: PeerId) -> Vec<IpNet> {
        self.inner
            .lock()
            .peer_mut(id)
            .map(|p| p.allowed_ips.clone())
            .unwrap_or_default()
    }

    /// Starts a new handshake initiation to `id`, returning the
    /// datagram to send and the endpoint to send it to.
    pub fn initiate_handshake(&self, id: PeerId) -> Option<(Vec<u8>, SocketAddr)> {
        let mut inner = self.inner.lock();
        let initiator_cfg = inner.initiator_config();
        let our_index = inner.indices.allocate(&mut OsRng, id, IndexPurpose::Handshake);
        let peer = inner.peer_mut(id)?;
        let peer_cfg = StaticPeerConfig::new(peer.config.key, Some(peer.config.preshared_key));
        let esk_i = StaticSecret::random_from_rng(OsRng);
        let (msg, state) = encrypt_handshake_init(
            &initiator_cfg,
            &peer_cfg,
            &esk_i,
            Tai64N::now(),
            our_index,
            peer.cookie.current(),
        );
        let endpoint = peer.endpoint?;
        peer.handshake = HandshakeSlot::CreatedInitiation {
            state,
            ephemeral_secret: esk_i,
            our_index,
            started_at: Instant::now(),
        };
        peer.timers.on_handshake_initiated(Instant::now());
        Some((zerocopy::AsBytes::as_bytes(&msg).to_vec(), endpoint))
    }

    /// Encrypts and returns an empty keepalive transport message for
    /// `id` (spec §4.6's "empty transport message"), or `None` if the
    /// peer has no usable keypair or endpoint yet.
    pub fn send_keepalive(&self, id: PeerId) -> Option<(Vec<u8>, SocketAddr)> {
        let mut inner = self.inner.lock();
        let peer = inner.peer_mut(id)?;
        let endpoint = peer.endpoint?;
        let kp = peer.keypairs.current()?;
        let nonce = kp.next_send_nonce()?;
        let job = EncryptJob {
            peer: id,
            seq: nonce,
            endpoint,
            receiver_index: kp.remote_index,
            nonce_counter: nonce,
            key: *kp.send_key(),
            plaintext: Vec::new(),
        };
        let result = pipeline::encrypt_one(job);
        peer.on_data_sent(Instant::now(), result.datagram.len() as u64);
        Some((result.datagram, result.endpoint))
    }

    /// Handles an inbound initiation, returning the response datagram
    /// to send and the endpoint, or `None` if it was rejected/dropped.
    pub fn handle_initiation(
        &self,
        bytes: &[u8],
        from: SocketAddr,
    ) -> Option<(Vec<u8>, SocketAddr)> {
        let mut msg = HandshakeInit::read_from(bytes)?;
        let mut inner = self.inner.lock();

        let overloaded = inner.rate_limiter.overloaded(now_ticks());
        let cookie = inner.rate_limiter.cookie_for(from);
        let initiator_cfg = inner.initiator_config();
        let mac1_key = initiator_cfg.mac1_key.clone();
        match msg.verify(&mac1_key, overloaded, &cookie) {
            Err(_) => return None,
            Ok(std::ops::ControlFlow::Break(())) => {
                // Valid mac1 but missing/stale mac2 under load: reply
                // with a fresh cookie instead of doing the DH work.
                return inner.rate_limiter.try_reply(from.ip(), now_ticks()).then(|| {
                    (build_cookie_reply(&mut inner, &msg, &cookie, from), from)
                });
            }
            Ok(std::ops::ControlFlow::Continue(_)) => {}
        }

        let peers = &inner.peers;
        let decrypted = decrypt_handshake_init(&mut msg, &initiator_cfg, |spk| {
            peers
                .iter()
                .flatten()
                .find(|p| &p.config.key == spk)
                .map(|p| (p.precomputed_ss, [0u8; 32]))
        })
        .ok()?;
        let (decrypted, mut state) = decrypted;

        let (peer_id, _) = inner.find_peer_mut(&decrypted.static_key)?;
        {
            let peer = inner.peer_mut(peer_id)?;
            if !peer.accept_initiation_timestamp(decrypted.timestamp) {
                return None;
            }
            peer.endpoint = Some(from);
            peer.handshake = HandshakeSlot::ConsumedInitiation {
                state: state.clone(),
                their_index: decrypted.sender_index,
            };
        }

        let peer = inner.peer_mut(peer_id)?;
        let peer_cfg = StaticPeerConfig::new(peer.config.key, Some(peer.config.preshared_key));
        let our_index = {
            let id = inner.indices.allocate(&mut OsRng, peer_id, IndexPurpose::Handshake);
            id
        };
        let esk_r = StaticSecret::random_from_rng(OsRng);
        let cookie = inner.rate_limiter.cookie_for(from);
        let (resp, send_key, recv_key) =
            encrypt_handshake_resp(&mut state, &decrypted, &esk_r, &peer_cfg, our_index, Some(&cookie));

        let keypair_index = inner.indices.allocate(&mut OsRng, peer_id, IndexPurpose::Keypair);
        let peer = inner.peer_mut(peer_id)?;
        peer.keypairs.insert_next(Keypair::new(
            Role::Responder,
            keypair_index,
            decrypted.sender_index,
            send_key.into(),
            recv_key.into(),
            Instant::now(),
        ));
        peer.handshake = HandshakeSlot::Zeroed;
        peer.timers.on_handshake_completed(Instant::now());

        let flushed = flush_staged(&mut inner, peer_id);
        let bind = inner.bind.clone();
        let reply = zerocopy::AsBytes::as_bytes(&resp).to_vec();
        drop(inner);
        send_flushed(&bind, flushed);

        Some((reply, from))
    }

    /// Handles an inbound response to our own in-flight initiation.
    pub fn handle_response(&self, bytes: &[u8], from: SocketAddr) -> bool {
        let mut msg = match HandshakeResp::read_from(bytes) {
            Some(m) => m,
            None => return false,
        };
        let mut inner = self.inner.lock();
        let overloaded = inner.rate_limiter.overloaded(now_ticks());
        let cookie = inner.rate_limiter.cookie_for(from);
        let initiator_cfg = inner.initiator_config();
        if msg.verify(&initiator_cfg.mac1_key, overloaded, &cookie).is_err() {
            return false;
        }

        let Some(id) = inner.indices.lookup(msg.receiver_index.get()) else {
            return false;
        };
        if id.purpose != IndexPurpose::Handshake {
            return false;
        }
        let peer_id = id.peer;
        let Some(peer) = inner.peer_mut(peer_id) else {
            return false;
        };
        let HandshakeSlot::CreatedInitiation {
            state,
            ephemeral_secret,
            our_index,
            ..
        } = std::mem::take(&mut peer.handshake)
        else {
            return false;
        };
        if our_index != msg.receiver_index.get() {
            peer.handshake = HandshakeSlot::CreatedInitiation {
                state,
                ephemeral_secret,
                our_index,
                started_at: Instant::now(),
            };
            return false;
        }

        let peer_cfg = StaticPeerConfig::new(peer.config.key, Some(peer.config.preshared_key));
        let Ok((send, recv)) =
            decrypt_handshake_resp(&mut msg, state, &ephemeral_secret, &initiator_cfg, &peer_cfg)
        else {
            return false;
        };

        inner.indices.repurpose(our_index, IndexPurpose::Keypair);
        let peer = inner.peer_mut(peer_id).expect("peer still exists, lock held throughout");
        peer.keypairs.insert_current(Keypair::new(
            Role::Initiator,
            our_index,
            msg.sender_index.get(),
            send.into(),
            recv.into(),
            Instant::now(),
        ));
        peer.handshake = HandshakeSlot::Zeroed;
        peer.endpoint = Some(from);
        peer.timers.on_handshake_completed(Instant::now());
        peer.timers.on_authenticated_received(Instant::now());

        let flushed = flush_staged(&mut inner, peer_id);
        let bind = inner.bind.clone();
        drop(inner);
        send_flushed(&bind, flushed);
        true
    }

    /// Polls every peer's timers and returns the events that fired, so
    /// the caller's timer thread can act on them (send keepalives,
    /// start handshakes, zeroize keys).
    pub fn poll_timers(&self) -> Vec<(PeerId, TimerEvent)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.rate_limiter.maybe_rotate_secret(&mut OsRng, now);
        inner.rate_limiter.evict_idle(now_ticks(), RATE_LIMITER_IDLE_TICKS);
        let mut fired = Vec::new();
        for (id, peer) in inner.peers.iter_mut().enumerate() {
            let Some(peer) = peer else { continue };
            for event in peer.timers.poll(now) {
                if event == TimerEvent::ZeroKeys {
                    peer.keypairs.clear();
                }
                fired.push((id, event));
            }
            peer.keypairs.retire_expired(now);
        }
        fired
    }

    /// Classifies an outbound IP frame by destination and either
    /// encrypts it immediately (a usable keypair exists) or stages it
    /// and signals that a handshake is needed (spec §4.6 "Outbound").
    pub fn process_outbound_frame(&self, frame: Vec<u8>) -> OutboundOutcome {
        let Some(dest) = dest_addr(&frame) else {
            return OutboundOutcome::Unroutable;
        };
        let mut inner = self.inner.lock();
        let Some(peer_id) = inner.allowed_ips.lookup(dest) else {
            return OutboundOutcome::Unroutable;
        };
        let now = Instant::now();
        let has_keypair = inner.peer_mut(peer_id).is_some_and(|p| p.has_usable_keypair(now));
        if !has_keypair {
            let needs_handshake = inner
                .peer_mut(peer_id)
                .is_some_and(|p| !p.handshake_in_flight());
            if let Some(peer) = inner.peer_mut(peer_id) {
                peer.stage(frame);
            }
            return if needs_handshake {
                OutboundOutcome::NeedsHandshake(peer_id)
            } else {
                OutboundOutcome::Queued
            };
        }

        let Some(peer) = inner.peer_mut(peer_id) else {
            return OutboundOutcome::Unroutable;
        };
        let Some(endpoint) = peer.endpoint else {
            peer.stage(frame);
            return OutboundOutcome::Queued;
        };
        let Some(kp) = peer.keypairs.current() else {
            peer.stage(frame);
            return OutboundOutcome::Queued;
        };
        let Some(nonce) = kp.next_send_nonce() else {
            peer.stage(frame);
            return OutboundOutcome::NeedsHandshake(peer_id);
        };
        let job = EncryptJob {
            peer: peer_id,
            seq: nonce,
            endpoint,
            receiver_index: kp.remote_index,
            nonce_counter: nonce,
            key: *kp.send_key(),
            plaintext: frame,
        };
        let result = pipeline::encrypt_one(job);
        peer.on_data_sent(Instant::now(), result.datagram.len() as u64);
        OutboundOutcome::Send {
            datagram: result.datagram,
            to: result.endpoint,
        }
    }

    /// Handles an inbound datagram already known to be a transport
    /// message (spec §4.6 "Inbound"): looks up the keypair by receiver
    /// index, decrypts, updates anti-replay and roaming state, and
    /// applies the reverse-path allowed-IPs check.
    pub fn process_inbound_transport(&self, bytes: &[u8], from: SocketAddr) -> InboundOutcome {
        if bytes.len() < TRANSPORT_HEADER_LEN + 16 {
            return InboundOutcome::Drop;
        }
        let Some(header) = TransportHeader::read_from_prefix(bytes) else {
            return InboundOutcome::Drop;
        };
        let body = &bytes[TRANSPORT_HEADER_LEN..];

        let mut inner = self.inner.lock();
        let Some(entry) = inner.indices.lookup(header.receiver_index.get()) else {
            return InboundOutcome::Drop;
        };
        if entry.purpose != IndexPurpose::Keypair {
            return InboundOutcome::Drop;
        }
        let peer_id = entry.peer;
        let Some(peer) = inner.peer_mut(peer_id) else {
            return InboundOutcome::Drop;
        };
        let Some(kp) = peer.keypairs.find_by_local_index(header.receiver_index.get()) else {
            return InboundOutcome::Drop;
        };
        let counter = header.counter.get();
        if !kp.accept_nonce(counter) {
            peer.counters.rx_replay_drops += 1;
            return InboundOutcome::Drop;
        }
        let key = *kp.recv_key();
        let local_index = kp.local_index;

        let result = pipeline::decrypt_one(DecryptJob {
            peer: peer_id,
            seq: counter,
            key,
            ciphertext_and_tag: body.to_vec(),
        });
        let Some(plaintext) = result.plaintext else {
            peer.counters.rx_auth_failures += 1;
            return InboundOutcome::Drop;
        };

        // Decryption succeeded: safe to update roaming endpoint and
        // anti-replay/timer state (spec §4.6: "if and only if the
        // decryption succeeded").
        peer.endpoint = Some(from);
        peer.on_data_received(Instant::now(), plaintext.len() as u64);
        peer.timers.on_authenticated_received(Instant::now());
        peer.keypairs.promote_if_next(local_index);

        let outcome = if plaintext.is_empty() {
            InboundOutcome::Keepalive
        } else {
            match inner_src_addr(&plaintext) {
                Some(src) if inner.allowed_ips.peer_owns(peer_id, src) => {
                    InboundOutcome::DeliverToTun { frame: plaintext }
                }
                _ => InboundOutcome::Drop,
            }
        };

        // A promoted-to-current keypair may have just made previously
        // staged frames sendable (spec §4.6).
        let flushed = flush_staged(&mut inner, peer_id);
        let bind = inner.bind.clone();
        drop(inner);
        send_flushed(&bind, flushed);

        outcome
    }

    /// Top-level inbound demux (spec §4.6: "demultiplexed by first
    /// byte").
    pub fn process_inbound_datagram(&self, bytes: &[u8], from: SocketAddr) -> InboundOutcome {
        match classify(bytes) {
            Some(MSG_INITIATION) => match self.handle_initiation(bytes, from) {
                Some((datagram, to)) => InboundOutcome::Reply { datagram, to },
                None => InboundOutcome::Drop,
            },
            Some(MSG_RESPONSE) => {
                if self.handle_response(bytes, from) {
                    InboundOutcome::Keepalive
                } else {
                    InboundOutcome::Drop
                }
            }
            Some(MSG_TRANSPORT) => self.process_inbound_transport(bytes, from),
            _ => InboundOutcome::Drop,
        }
    }
}

/// Outcome of classifying and (maybe) encrypting one outbound frame.
pub enum OutboundOutcome {
    Send { datagram: Vec<u8>, to: SocketAddr },
    Queued,
    NeedsHandshake(PeerId),
    Unroutable,
}

/// How long a per-source cookie bucket can sit unused before
/// `poll_timers` evicts it (spec §4.7) — ~120s at the quarter-second
/// tick rate `now_ticks` uses, matching the secret rotation period.
const RATE_LIMITER_IDLE_TICKS: u64 = 480;

fn now_ticks() -> u64 {
    // A millisecond tick counter anchored to process start; the rate
    // limiter only cares about relative spacing, not wall-clock time.
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Instant::now().duration_since(start).as_millis() as u64 / 250
}

fn build_cookie_reply(
    inner: &mut Inner,
    init: &HandshakeInit,
    cookie: &wireguard_types::Cookie,
    _from: SocketAddr,
) -> Vec<u8> {
    let nonce = wireguard_crypto::cookie_nonce_rng(&mut OsRng);
    let our_cookie_key = inner.initiator_config().cookie_key;
    let encrypted = wireguard_crypto::encrypt_cookie(*cookie, &our_cookie_key, &nonce, &init.mac1);
    let reply = wireguard_types::CookieReply {
        message_type: MSG_COOKIE_REPLY.into(),
        receiver_index: init.sender_index,
        nonce: nonce.into(),
        encrypted_cookie: encrypted,
    };
    zerocopy::AsBytes::as_bytes(&reply).to_vec()
}

/// Demultiplexes an inbound datagram by its first byte (spec §4.6).
fn classify(datagram: &[u8]) -> Option<u32> {
    datagram.first().map(|&b| b as u32)
}

/// Drains a peer's staged outbound frames through whatever keypair is
/// currently usable for sending, in FIFO order (spec §4.6: staged
/// frames are dispatched, in sequence, once a keypair becomes
/// available). A no-op if the peer has no endpoint or no sendable
/// keypair yet — called unconditionally whenever a handshake completes
/// or a keypair is promoted, so callers don't need to know which case
/// actually made sending possible.
fn flush_staged(inner: &mut Inner, peer_id: PeerId) -> Vec<(Vec<u8>, SocketAddr)> {
    let Some(peer) = inner.peer_mut(peer_id) else {
        return Vec::new();
    };
    let Some(endpoint) = peer.endpoint else {
        return Vec::new();
    };
    let mut sent = Vec::new();
    while peer.keypairs.current().is_some() && !peer.staging.is_empty() {
        let kp = peer.keypairs.current().expect("checked above");
        let Some(nonce) = kp.next_send_nonce() else {
            break; // keypair exhausted; remaining frames stay staged for the next one
        };
        let receiver_index = kp.remote_index;
        let key = *kp.send_key();
        let staged = peer.staging.pop_front().expect("checked non-empty above");
        let job = EncryptJob {
            peer: peer_id,
            seq: nonce,
            endpoint,
            receiver_index,
            nonce_counter: nonce,
            key,
            plaintext: staged.payload,
        };
        let result = pipeline::encrypt_one(job);
        peer.on_data_sent(Instant::now(), result.datagram.len() as u64);
        sent.push((result.datagram, result.endpoint));
    }
    sent
}

/// Sends out whatever `flush_staged` collected, after the device lock
/// has already been released (spec §5: never hold the lock across
/// blocking I/O).
fn send_flushed(bind: &Option<Arc<dyn Bind>>, flushed: Vec<(Vec<u8>, SocketAddr)>) {
    let Some(bind) = bind else { return };
    for (datagram, to) in flushed {
        let _ = bind.send_to(&datagram, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn new_device() -> Device {
        Device::new(DeviceConfig {
            private_key: StaticSecret::random_from_rng(OsRng),
            listen_port: None,
            fwmark: None,
        })
    }

    fn ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; 20 + payload.len()];
        frame[0] = 0x45;
        let total_len = (20 + payload.len()) as u16;
        frame[2..4].copy_from_slice(&total_len.to_be_bytes());
        frame[9] = 17;
        frame[12..16].copy_from_slice(&src.octets());
        frame[16..20].copy_from_slice(&dst.octets());
        frame[20..].copy_from_slice(payload);
        frame
    }

    /// End-to-end: initiator sends an initiation, responder replies,
    /// initiator completes, then a data frame flows both directions
    /// through the installed keypairs and the reverse-path check.
    #[test]
    fn full_handshake_and_data_round_trip() {
        let initiator = new_device();
        let responder = new_device();
        let initiator_pub = initiator.public_key();
        let responder_pub = responder.public_key();

        let initiator_addr: SocketAddr = "127.0.0.1:10001".parse().unwrap();
        let responder_addr: SocketAddr = "127.0.0.1:10002".parse().unwrap();

        let id_responder = initiator.add_peer(responder_pub, None).unwrap();
        initiator.set_peer_endpoint(id_responder, responder_addr);
        initiator.set_peer_allowed_ips(
            id_responder,
            vec!["10.0.0.2/32".parse().unwrap()],
        );

        let id_initiator = responder.add_peer(initiator_pub, None).unwrap();
        responder.set_peer_allowed_ips(
            id_initiator,
            vec!["10.0.0.1/32".parse().unwrap()],
        );

        let (init_bytes, to) = initiator.initiate_handshake(id_responder).unwrap();
        assert_eq!(to, responder_addr);

        let (resp_bytes, to) = responder
            .handle_initiation(&init_bytes, initiator_addr)
            .unwrap();
        assert_eq!(to, initiator_addr);

        assert!(initiator.handle_response(&resp_bytes, responder_addr));

        let frame = ipv4_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            b"hello responder",
        );
        let OutboundOutcome::Send { datagram, to } = initiator.process_outbound_frame(frame.clone())
        else {
            panic!("expected an immediately sendable datagram");
        };
        assert_eq!(to, responder_addr);

        let InboundOutcome::DeliverToTun { frame: delivered } =
            responder.process_inbound_transport(&datagram, initiator_addr)
        else {
            panic!("expected the frame to be delivered to the responder's tun");
        };
        assert_eq!(delivered, frame);
    }

    /// A frame whose inner source address the peer isn't authorized
    /// for must be dropped even though decryption succeeds (spec
    /// §4.6's reverse-path check).
    #[test]
    fn inbound_frame_with_unauthorized_source_is_dropped() {
        let initiator = new_device();
        let responder = new_device();
        let initiator_pub = initiator.public_key();
        let responder_pub = responder.public_key();
        let initiator_addr: SocketAddr = "127.0.0.1:10003".parse().unwrap();
        let responder_addr: SocketAddr = "127.0.0.1:10004".parse().unwrap();

        let id_responder = initiator.add_peer(responder_pub, None).unwrap();
        initiator.set_peer_endpoint(id_responder, responder_addr);
        initiator.set_peer_allowed_ips(id_responder, vec!["10.0.0.2/32".parse().unwrap()]);

        let id_initiator = responder.add_peer(initiator_pub, None).unwrap();
        // Responder authorizes a different source than the one the
        // initiator will actually send from.
        responder.set_peer_allowed_ips(id_initiator, vec!["10.0.0.99/32".parse().unwrap()]);

        let (init_bytes, _) = initiator.initiate_handshake(id_responder).unwrap();
        let (resp_bytes, _) = responder.handle_initiation(&init_bytes, initiator_addr).unwrap();
        assert!(initiator.handle_response(&resp_bytes, responder_addr));

        let frame = ipv4_frame(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), b"x");
        let OutboundOutcome::Send { datagram, .. } = initiator.process_outbound_frame(frame) else {
            panic!("expected an immediately sendable datagram");
        };
        let outcome = responder.process_inbound_transport(&datagram, initiator_addr);
        assert!(matches!(outcome, InboundOutcome::Drop));
    }

    /// A frame staged while no keypair exists yet must be dispatched,
    /// in order, as soon as the handshake that unblocks it completes
    /// (spec §4.6).
    #[test]
    fn staged_frames_drain_once_handshake_completes() {
        let initiator = new_device();
        let responder = new_device();
        let initiator_pub = initiator.public_key();
        let responder_pub = responder.public_key();

        let initiator_addr: SocketAddr = "127.0.0.1:10005".parse().unwrap();
        let responder_addr: SocketAddr = "127.0.0.1:10006".parse().unwrap();

        let id_responder = initiator.add_peer(responder_pub, None).unwrap();
        initiator.set_peer_endpoint(id_responder, responder_addr);
        initiator.set_peer_allowed_ips(id_responder, vec!["10.0.0.2/32".parse().unwrap()]);

        let id_initiator = responder.add_peer(initiator_pub, None).unwrap();
        responder.set_peer_allowed_ips(id_initiator, vec!["10.0.0.1/32".parse().unwrap()]);

        let frame = ipv4_frame(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            b"queued before handshake",
        );
        let outcome = initiator.process_outbound_frame(frame);
        assert!(matches!(outcome, OutboundOutcome::NeedsHandshake(id) if id == id_responder));
        assert_eq!(
            initiator.with_inner(|inner| inner.peer_mut(id_responder).unwrap().staging.len()),
            1
        );

        let (init_bytes, _) = initiator.initiate_handshake(id_responder).unwrap();
        let (resp_bytes, _) = responder.handle_initiation(&init_bytes, initiator_addr).unwrap();
        assert!(initiator.handle_response(&resp_bytes, responder_addr));

        assert_eq!(
            initiator.with_inner(|inner| inner.peer_mut(id_responder).unwrap().staging.len()),
            0
        );
    }

    #[test]
    fn remove_peer_then_lookup_returns_unknown() {
        let device = new_device();
        let other = StaticSecret::random_from_rng(OsRng);
        let other_pub = PublicKey::from(&other);
        device.add_peer(other_pub, None).unwrap();
        device.remove_peer(&other_pub).unwrap();
        assert!(matches!(device.remove_peer(&other_pub), Err(DeviceError::UnknownPeer)));
    }
}
