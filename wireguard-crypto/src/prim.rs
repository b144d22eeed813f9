//! Noise primitives: BLAKE2s hash/MAC, the WireGuard-flavoured
//! HMAC-based HKDF (1, 2 or 3 outputs, addressed individually rather
//! than through a single `expand` call), and the rolling `ck`/`h`
//! handshake transcript state.

use blake2::digest::{Digest, Mac as _, Output};
use blake2::{Blake2s256, Blake2sMac};
use chacha20poly1305::Key;
use hmac::SimpleHmac;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const LABEL_MAC1: &[u8; 8] = b"mac1----";
pub const LABEL_COOKIE: &[u8; 8] = b"cookie--";

/// Construction: "Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s", 37 bytes.
/// Identifier: "WireGuard v1 zx2c4 Jason@zx2c4.com", 34 bytes.
/// ck0 := Hash(Construction), h0 := Hash(ck0 || Identifier).
const CONSTRUCTION_HASH: [u8; 32] = [
    96, 226, 109, 174, 243, 39, 239, 192, 46, 195, 53, 226, 160, 37, 210, 208, 22, 235, 66, 6, 248,
    114, 119, 245, 45, 56, 209, 152, 139, 120, 205, 54,
];
const IDENTIFIER_HASH: [u8; 32] = [
    34, 17, 179, 97, 8, 26, 197, 102, 105, 18, 67, 219, 69, 138, 213, 50, 45, 156, 108, 102, 34,
    147, 232, 183, 14, 225, 156, 101, 186, 7, 158, 243,
];

pub type Mac = [u8; 16];

pub fn hash<const M: usize>(msg: [&[u8]; M]) -> Output<Blake2s256> {
    let mut digest = Blake2s256::default();
    for m in msg {
        digest.update(m);
    }
    digest.finalize()
}

/// Keyed, 128-bit BLAKE2s MAC. Used for mac1 (keyed by a hash of the
/// responder's static key, public knowledge) and mac2 (keyed by the
/// rotating cookie secret).
pub fn mac(key: &[u8], msg: &[u8]) -> Mac {
    let mut mac = Blake2sMac::<chacha20poly1305::consts::U16>::new_from_slice(key)
        .expect("blake2s mac accepts any key length up to its block size");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

fn hmac(key: &Key, msg: &[u8]) -> Output<Blake2s256> {
    let mut hmac = <SimpleHmac<Blake2s256> as hmac::Mac>::new_from_slice(key)
        .expect("hmac accepts any key length");
    hmac.update(msg);
    hmac.finalize().into_bytes()
}

/// WireGuard's HKDF: produces `N` chained outputs from `key` and
/// `input`, matching the Noise spec's `HKDF(ck, input, n)` exactly
/// (`N` is always 1, 2 or 3 in this protocol).
fn hkdf<const N: usize>(key: &Key, input: &[u8]) -> [Key; N] {
    assert!(N >= 1 && N <= 3, "WireGuard only ever needs 1-3 HKDF outputs");
    let mut out = [Key::default(); N];
    let t0 = hmac(key, input);
    let mut ti = hmac(&t0, &[1]);
    out[0] = ti;
    for i in 1..N {
        let mut buf = ti.to_vec();
        buf.push(i as u8 + 1);
        ti = hmac(&t0, &buf);
        out[i] = ti;
    }
    out
}

pub fn mac1_key(responder_static: &PublicKey) -> Key {
    hash([LABEL_MAC1, responder_static.as_bytes()])
}

pub fn cookie_key(responder_static: &PublicKey) -> Key {
    hash([LABEL_COOKIE, responder_static.as_bytes()])
}

/// The rolling Noise transcript: chaining key `ck` and hash `h`.
/// Zeroized on drop since `ck` is key material for every AEAD key
/// derived during the handshake.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HandshakeState {
    chain: Key,
    hash: Key,
}

impl Default for HandshakeState {
    fn default() -> Self {
        Self {
            chain: Key::from(CONSTRUCTION_HASH),
            hash: Key::from(IDENTIFIER_HASH),
        }
    }
}

impl HandshakeState {
    pub fn mix_hash(&mut self, b: &[u8]) {
        self.hash = hash([&self.hash, b]);
    }

    pub fn mix_chain(&mut self, b: &[u8]) {
        let [c] = hkdf(&self.chain, b);
        self.chain = c;
    }

    pub fn mix_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) {
        let shared = sk.diffie_hellman(pk);
        let [c] = hkdf(&self.chain, shared.as_bytes());
        self.chain = c;
    }

    /// Mixes a DH result and returns the derived AEAD key (the
    /// second HKDF output), as used for `es`, `ss`, `ee`, `se`.
    pub fn mix_key_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) -> Key {
        let shared = sk.diffie_hellman(pk);
        let [c, k] = hkdf(&self.chain, shared.as_bytes());
        self.chain = c;
        k
    }

    /// Same as `mix_key_dh` but the DH has already been performed by
    /// the caller (used to mix a peer's cached static-static shared
    /// secret, computed once at configuration time rather than once
    /// per handshake).
    pub fn mix_key_precomputed(&mut self, shared: &[u8; 32]) -> Key {
        let [c, k] = hkdf(&self.chain, shared);
        self.chain = c;
        k
    }

    /// Exposes the current transcript hash as associated data for the
    /// next AEAD seal/open performed outside this module (the wire
    /// types in `wireguard-types` own the actual AEAD call).
    pub fn current_hash(&self) -> [u8; 32] {
        self.hash.into()
    }

    /// The `psk` mixing step: three HKDF outputs, the middle one is
    /// mixed into `h` directly (not used as key material), the third
    /// becomes the AEAD key for the following empty payload.
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> Key {
        let [c, t, k] = hkdf(&self.chain, psk);
        self.chain = c;
        self.mix_hash(&t);
        k
    }

    /// Final key split: `(T1, T2) = HKDF(ck, "")`.
    pub fn split(mut self) -> (Key, Key) {
        let [k1, k2] = hkdf(&self.chain, &[]);
        self.zeroize();
        (k1, k2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blake2::Digest;

    #[test]
    fn construction_identifier_constants() {
        let c = Blake2s256::default()
            .chain_update(b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s")
            .finalize();
        let h = Blake2s256::default()
            .chain_update(c)
            .chain_update(b"WireGuard v1 zx2c4 Jason@zx2c4.com")
            .finalize();
        assert_eq!(&*c, &CONSTRUCTION_HASH);
        assert_eq!(&*h, &IDENTIFIER_HASH);
    }

    #[test]
    fn hkdf_is_deterministic() {
        let key = Key::from([0u8; 32]);
        let a: [Key; 2] = hkdf(&key, b"input");
        let b: [Key; 2] = hkdf(&key, b"input");
        assert_eq!(a, b);
    }
}
