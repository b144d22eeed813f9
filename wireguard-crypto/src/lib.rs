#![no_std]
//! Noise_IKpsk2 handshake (spec §4.3) over Curve25519/BLAKE2s/ChaCha20Poly1305,
//! plus the cookie-reply AEAD (XChaCha20Poly1305) used for DoS mitigation
//! (spec §4.7). This crate never allocates, never touches the network,
//! and never decides *whether* a peer is known — it only proves or
//! disproves cryptographic claims about the bytes it's handed.

use core::net::SocketAddr;
use core::ops::ControlFlow;

use prim::{cookie_key, mac, mac1_key};
pub use prim::{HandshakeState, Mac};
pub use x25519_dalek::{PublicKey, StaticSecret};

use chacha20poly1305::{Key, XNonce};
use rand_core::{CryptoRng, RngCore};
use tai64::Tai64N;
use wireguard_types::{
    Cookie, EncryptedCookie, HandshakeInit, HandshakeResp, MSG_INITIATION, MSG_RESPONSE,
};
use wireguard_utils::RandomizedState;
use zeroize::{Zeroize, ZeroizeOnDrop};

mod prim;

#[cfg(any(test, wireguard_unsafe_logging))]
extern crate std;

/// Logs only compiled in for tests or when explicitly opted into via
/// `--cfg wireguard_unsafe_logging` (mirrors the conditional tracing
/// the teacher gates behind `rustyguard_unsafe_logging`); this path
/// never runs in a normal build because it can print key material.
macro_rules! unsafe_log {
    ($($t:tt)*) => {
        match core::format_args!($($t)*) {
            #[cfg(any(test, wireguard_unsafe_logging))]
            args => std::eprintln!("{args}"),
            #[cfg(not(any(test, wireguard_unsafe_logging)))]
            _ => {}
        };
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD tag verification failed; the message is corrupt, replayed
    /// with a stale key, or forged.
    DecryptionFailed,
    /// mac1 or mac2 did not match; reject before spending any CPU on
    /// the expensive DH operations.
    MacRejected,
}

pub fn cookie_nonce_rng(rng: &mut (impl CryptoRng + RngCore)) -> XNonce {
    let mut nonce = XNonce::default();
    rng.fill_bytes(&mut nonce);
    nonce
}

pub fn decrypt_cookie<'c>(
    reply: &'c mut EncryptedCookie,
    key: &Key,
    nonce: &[u8; 24],
    mac1: &Mac,
) -> Result<&'c Cookie, CryptoError> {
    reply
        .decrypt(key, nonce.into(), mac1)
        .map_err(|_| CryptoError::DecryptionFailed)
}

pub fn encrypt_cookie(
    cookie: Cookie,
    key: &Key,
    nonce: &XNonce,
    mac1: &Mac,
) -> EncryptedCookie {
    EncryptedCookie::encrypt(cookie, key, nonce, mac1)
}

/// Per-peer cookie bookkeeping for the *initiator* side: the last
/// cookie received from this peer, used to stamp mac2 on the next
/// retried initiation.
#[derive(Default)]
pub struct PeerCookie {
    cookie: Option<Cookie>,
}

impl PeerCookie {
    pub fn store(&mut self, cookie: Cookie) {
        self.cookie = Some(cookie);
    }

    pub fn clear(&mut self) {
        self.cookie = None;
    }

    pub fn current(&self) -> Option<&Cookie> {
        self.cookie.as_ref()
    }
}

/// The responder's rotating cookie secret (spec §4.7: refreshed every
/// 120s by the caller). Deriving a cookie for a source address is a
/// single keyed MAC, cheap enough to do unconditionally per datagram.
#[derive(Zeroize, ZeroizeOnDrop, Default)]
pub struct CookieSecret {
    key: [u8; 32],
}

impl CookieSecret {
    pub fn regenerate(&mut self, rng: &mut (impl CryptoRng + RngCore)) {
        rng.fill_bytes(&mut self.key);
    }

    pub fn cookie_for(&self, addr: SocketAddr) -> Cookie {
        // No specified wire encoding for the cookie input; it only needs
        // to bind the secret to the source endpoint.
        let mut buf = [0u8; 18];
        match addr.ip() {
            core::net::IpAddr::V4(v4) => buf[..4].copy_from_slice(&v4.octets()),
            core::net::IpAddr::V6(v6) => buf[..16].copy_from_slice(&v6.octets()),
        }
        buf[16..].copy_from_slice(&addr.port().to_be_bytes());
        Cookie(mac(&self.key, &buf))
    }
}

/// Both handshake messages carry two trailing MACs. mac1 is keyed by a
/// public value (hash of the responder's static key) and is always
/// checked first — cheap enough to reject garbage before anything
/// secret-dependent runs. mac2 is only checked while the responder is
/// rate-limiting, and is keyed by a cookie the initiator must have
/// fetched via a cookie-reply round trip.
pub trait HasMac: Sized {
    fn message_bytes(&self) -> &[u8];
    fn mac1_offset() -> usize;
    fn mac2_offset() -> usize;
    fn mac1(&self) -> &Mac;
    fn mac2(&self) -> &Mac;
    fn set_mac1(&mut self, m: Mac);
    fn set_mac2(&mut self, m: Mac);

    fn compute_mac1(&self, mac1_key: &Key) -> Mac {
        mac(mac1_key, &self.message_bytes()[..Self::mac1_offset()])
    }

    fn compute_mac2(&self, cookie: &Cookie) -> Mac {
        mac(&cookie.0, &self.message_bytes()[..Self::mac2_offset()])
    }

    fn stamp(&mut self, mac1_key: &Key, cookie: Option<&Cookie>) {
        let m1 = self.compute_mac1(mac1_key);
        self.set_mac1(m1);
        if let Some(cookie) = cookie {
            let m2 = self.compute_mac2(cookie);
            self.set_mac2(m2);
        }
    }

    /// Verify mac1 unconditionally; verify mac2 only under load. When
    /// overloaded and mac2 fails, the caller gets the cookie to send
    /// back instead of proceeding with the (expensive) handshake math.
    fn verify(
        &mut self,
        mac1_key: &Key,
        overloaded: bool,
        cookie: &Cookie,
    ) -> Result<ControlFlow<(), &mut Self>, CryptoError> {
        let actual1 = self.compute_mac1(mac1_key);
        if &actual1 != self.mac1() {
            unsafe_log!("mac1 rejected");
            return Err(CryptoError::MacRejected);
        }
        if overloaded {
            let actual2 = self.compute_mac2(cookie);
            if &actual2 != self.mac2() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(self))
    }
}

macro_rules! mac_protected {
    ($ty:ident) => {
        impl HasMac for $ty {
            fn message_bytes(&self) -> &[u8] {
                zerocopy::AsBytes::as_bytes(self)
            }
            fn mac1_offset() -> usize {
                core::mem::offset_of!($ty, mac1)
            }
            fn mac2_offset() -> usize {
                core::mem::offset_of!($ty, mac2)
            }
            fn mac1(&self) -> &Mac {
                &self.mac1
            }
            fn mac2(&self) -> &Mac {
                &self.mac2
            }
            fn set_mac1(&mut self, m: Mac) {
                self.mac1 = m;
            }
            fn set_mac2(&mut self, m: Mac) {
                self.mac2 = m;
            }
        }
    };
}

mac_protected!(HandshakeInit);
mac_protected!(HandshakeResp);

/// Cached, per-peer values that never change once the peer is
/// configured: its public key, preshared key, and the two keys derived
/// from its static key for mac1/cookie verification.
pub struct StaticPeerConfig {
    pub key: PublicKey,
    pub preshared_key: [u8; 32],
    pub mac1_key: Key,
    pub cookie_key: Key,
}

impl StaticPeerConfig {
    pub fn new(key: PublicKey, preshared_key: Option<[u8; 32]>) -> Self {
        Self {
            mac1_key: mac1_key(&key),
            cookie_key: cookie_key(&key),
            key,
            preshared_key: preshared_key.unwrap_or_default(),
        }
    }
}

/// Cached values for our own identity key.
pub struct StaticInitiatorConfig {
    pub private_key: StaticSecret,
    pub public_key: PublicKey,
    pub mac1_key: Key,
    pub cookie_key: Key,
}

impl StaticInitiatorConfig {
    pub fn new(private_key: StaticSecret) -> Self {
        let public_key = PublicKey::from(&private_key);
        Self {
            mac1_key: mac1_key(&public_key),
            cookie_key: cookie_key(&public_key),
            public_key,
            private_key,
        }
    }
}

/// A `HandshakeInit` whose AEAD payloads have been successfully opened;
/// `static_key`/`timestamp` are now safe to read as plaintext.
#[derive(Clone, Copy)]
pub struct DecryptedHandshakeInit {
    pub sender_index: u32,
    pub ephemeral_key: PublicKey,
    pub static_key: PublicKey,
    pub timestamp: Tai64N,
}

/// I -> R. Builds the 148-byte initiation message and returns the
/// transcript state so the caller can hold it until a response arrives
/// (or time it out and restart).
pub fn encrypt_handshake_init(
    initiator: &StaticInitiatorConfig,
    peer: &StaticPeerConfig,
    esk_i: &StaticSecret,
    now: Tai64N,
    sender_index: u32,
    cookie: Option<&Cookie>,
) -> (HandshakeInit, HandshakeState) {
    let mut hs = HandshakeState::default();

    let epk_i = PublicKey::from(esk_i);
    hs.mix_hash(peer.key.as_bytes());
    hs.mix_chain(epk_i.as_bytes());
    hs.mix_hash(epk_i.as_bytes());

    let k = hs.mix_key_dh(esk_i, &peer.key);
    let static_ct = {
        let aad = hs_aad(&hs);
        let enc = wireguard_types::EncryptedPublicKey::encrypt(initiator.public_key.to_bytes(), &k, &aad);
        hs.mix_hash(zerocopy::AsBytes::as_bytes(&enc));
        enc
    };

    let k = hs.mix_key_dh(&initiator.private_key, &peer.key);
    let timestamp_ct = {
        let aad = hs_aad(&hs);
        let enc = wireguard_types::EncryptedTimestamp::encrypt(now.to_bytes(), &k, &aad);
        hs.mix_hash(zerocopy::AsBytes::as_bytes(&enc));
        enc
    };

    let mut msg = HandshakeInit {
        message_type: MSG_INITIATION.into(),
        sender_index: sender_index.into(),
        unencrypted_ephemeral: epk_i.to_bytes(),
        encrypted_static: static_ct,
        encrypted_timestamp: timestamp_ct,
        mac1: [0; 16],
        mac2: [0; 16],
    };
    msg.stamp(&peer.mac1_key, cookie);

    (msg, hs)
}

/// Helper: the AEAD associated data for a handshake payload is always
/// "the transcript hash *before* this field was mixed in". Since
/// `encrypt`/`decrypt` on the wire types don't know about `hs`, we
/// snapshot it just before each call and mix the ciphertext in after.
fn hs_aad(hs: &HandshakeState) -> [u8; 32] {
    hs.current_hash()
}

/// R <- I. Verifies both AEAD tags, extracts the initiator's static
/// key and timestamp. Caller still must: check the static key is a
/// configured peer, and check `timestamp` is strictly greater than the
/// last one seen from that peer (replay defense, spec §4.3/§8).
pub fn decrypt_handshake_init(
    init: &mut HandshakeInit,
    receiver: &StaticInitiatorConfig,
    lookup_peer_ss: impl FnOnce(&PublicKey) -> Option<([u8; 32], [u8; 32])>,
) -> Result<(DecryptedHandshakeInit, HandshakeState), CryptoError> {
    let mut hs = HandshakeState::default();
    hs.mix_hash(receiver.public_key.as_bytes());

    let epk_i = PublicKey::from(init.unencrypted_ephemeral);
    hs.mix_chain(epk_i.as_bytes());
    hs.mix_hash(epk_i.as_bytes());

    let k = hs.mix_key_dh(&receiver.private_key, &epk_i);
    let aad = hs_aad(&hs);
    let spk_i_bytes = *init
        .encrypted_static
        .decrypt(&k, &aad)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    hs.mix_hash(zerocopy::AsBytes::as_bytes(&init.encrypted_static));
    let spk_i = PublicKey::from(spk_i_bytes);

    // `ss` = DH(our static, their static). The caller supplies it
    // (precomputed at peer-configuration time, as spec §4 prescribes)
    // rather than this crate recomputing a DH per packet.
    let (ss, _unused) = lookup_peer_ss(&spk_i).ok_or(CryptoError::DecryptionFailed)?;
    let k = hs.mix_key_precomputed(&ss);

    let aad = hs_aad(&hs);
    let ts_bytes = *init
        .encrypted_timestamp
        .decrypt(&k, &aad)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    hs.mix_hash(zerocopy::AsBytes::as_bytes(&init.encrypted_timestamp));

    Ok((
        DecryptedHandshakeInit {
            sender_index: init.sender_index.get(),
            ephemeral_key: epk_i,
            static_key: spk_i,
            timestamp: Tai64N::from_slice(&ts_bytes).map_err(|_| CryptoError::DecryptionFailed)?,
        },
        hs,
    ))
}

/// R -> I. Completes the responder side: generates its own ephemeral,
/// mixes the PSK, and produces an *unconfirmed* send/recv keypair (not
/// usable for sending until we've received a transport message under
/// it, per the documented WireGuard "next" promotion rule — see
/// DESIGN.md).
pub fn encrypt_handshake_resp(
    hs: &mut HandshakeState,
    data: &DecryptedHandshakeInit,
    esk_r: &StaticSecret,
    peer: &StaticPeerConfig,
    sender_index: u32,
    cookie: Option<&Cookie>,
) -> (HandshakeResp, Key, Key) {
    let epk_r = PublicKey::from(esk_r);
    hs.mix_chain(epk_r.as_bytes());
    hs.mix_hash(epk_r.as_bytes());

    hs.mix_dh(esk_r, &data.ephemeral_key);
    hs.mix_dh(esk_r, &data.static_key);

    let k = hs.mix_key_and_hash(&peer.preshared_key);
    let aad = hs_aad(hs);
    let empty = wireguard_types::EncryptedEmpty::encrypt([], &k, &aad);
    hs.mix_hash(zerocopy::AsBytes::as_bytes(&empty));

    let mut msg = HandshakeResp {
        message_type: MSG_RESPONSE.into(),
        sender_index: sender_index.into(),
        receiver_index: data.sender_index.into(),
        unencrypted_ephemeral: epk_r.to_bytes(),
        encrypted_nothing: empty,
        mac1: [0; 16],
        mac2: [0; 16],
    };
    msg.stamp(&peer.mac1_key, cookie);

    let (recv, send) = core::mem::replace(hs, HandshakeState::default()).split();
    (msg, send, recv)
}

/// I <- R. Completes the initiator side. On success returns
/// `(send_key, recv_key)` for the new session.
pub fn decrypt_handshake_resp(
    resp: &mut HandshakeResp,
    hs: HandshakeState,
    esk_i: &StaticSecret,
    initiator: &StaticInitiatorConfig,
    peer: &StaticPeerConfig,
) -> Result<(Key, Key), CryptoError> {
    let mut hs = hs;
    let epk_r = PublicKey::from(resp.unencrypted_ephemeral);
    hs.mix_chain(epk_r.as_bytes());
    hs.mix_hash(epk_r.as_bytes());

    hs.mix_dh(esk_i, &epk_r);
    hs.mix_dh(&initiator.private_key, &epk_r);

    let k = hs.mix_key_and_hash(&peer.preshared_key);
    let aad = hs_aad(&hs);
    resp.encrypted_nothing
        .decrypt(&k, &aad)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    hs.mix_hash(zerocopy::AsBytes::as_bytes(&resp.encrypted_nothing));

    let (send, recv) = hs.split();
    Ok((send, recv))
}

/// Marker type kept so `RandomizedState` (used by `wireguard-core`'s
/// peer table) is reachable from crates that only depend on
/// `wireguard-crypto`, matching the teacher's re-export style.
pub type PeerTableHasher = RandomizedState;

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn gen_pair() -> (StaticSecret, PublicKey) {
        let sk = StaticSecret::random_from_rng(OsRng);
        let pk = PublicKey::from(&sk);
        (sk, pk)
    }

    #[test]
    fn full_handshake_round_trip() {
        let (i_sk, i_pk) = gen_pair();
        let (r_sk, r_pk) = gen_pair();

        let initiator_cfg = StaticInitiatorConfig::new(i_sk.clone());
        let responder_cfg = StaticInitiatorConfig::new(r_sk.clone());
        let peer_of_responder = StaticPeerConfig::new(r_pk, None);
        let peer_of_initiator = StaticPeerConfig::new(i_pk, None);

        let esk_i = StaticSecret::random_from_rng(OsRng);
        let now = Tai64N::now();

        let (mut init_msg, _init_hs) = encrypt_handshake_init(
            &initiator_cfg,
            &peer_of_responder,
            &esk_i,
            now,
            1,
            None,
        );

        let ss_ri = r_sk.diffie_hellman(&i_pk).to_bytes();
        let (decrypted, mut resp_hs) =
            decrypt_handshake_init(&mut init_msg, &responder_cfg, |_spk| Some((ss_ri, [0; 32])))
                .unwrap();
        assert_eq!(decrypted.static_key.as_bytes(), i_pk.as_bytes());

        let esk_r = StaticSecret::random_from_rng(OsRng);
        let (mut resp_msg, r_send, r_recv) = encrypt_handshake_resp(
            &mut resp_hs,
            &decrypted,
            &esk_r,
            &peer_of_initiator,
            2,
            None,
        );

        // Rebuild the initiator's transcript up to the point it would
        // be at after sending the initiation, to hand to
        // `decrypt_handshake_resp` (the production caller keeps this
        // around from `encrypt_handshake_init` instead of redoing it).
        let (_, init_hs) = encrypt_handshake_init(
            &initiator_cfg,
            &peer_of_responder,
            &esk_i,
            now,
            1,
            None,
        );

        let (i_send, i_recv) =
            decrypt_handshake_resp(&mut resp_msg, init_hs, &esk_i, &initiator_cfg, &peer_of_responder)
                .unwrap();

        assert_eq!(i_send, r_recv);
        assert_eq!(i_recv, r_send);
    }

    #[test]
    fn mac1_rejects_tampered_message() {
        let (i_sk, _i_pk) = gen_pair();
        let (_r_sk, r_pk) = gen_pair();
        let initiator_cfg = StaticInitiatorConfig::new(i_sk);
        let peer = StaticPeerConfig::new(r_pk, None);
        let esk_i = StaticSecret::random_from_rng(OsRng);

        let (mut msg, _hs) =
            encrypt_handshake_init(&initiator_cfg, &peer, &esk_i, Tai64N::now(), 7, None);
        msg.sender_index = 9999.into();

        let dummy_cookie = Cookie([0; 16]);
        let result = msg.verify(&peer.mac1_key, false, &dummy_cookie);
        assert!(matches!(result, Err(CryptoError::MacRejected)));
    }
}
