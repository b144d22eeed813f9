#![no_std]
//! Zero-copy wire structures for the WireGuard handshake and transport
//! messages (spec §6). Every message starts with a 4-byte little-endian
//! type tag (the high 3 bytes are the reserved-zero bytes from the wire
//! format); the rest of the layout matches the byte offsets the protocol
//! defines, so a `&[u8]` datagram can be reinterpreted in place with
//! `zerocopy::Ref` / `transmute_mut!` without a copy.

use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, Key, KeyInit, Nonce, XChaCha20Poly1305, XNonce};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const MSG_INITIATION: u32 = 1;
pub const MSG_RESPONSE: u32 = 2;
pub const MSG_COOKIE_REPLY: u32 = 3;
pub const MSG_TRANSPORT: u32 = 4;

pub const INITIATION_LEN: usize = core::mem::size_of::<HandshakeInit>();
pub const RESPONSE_LEN: usize = core::mem::size_of::<HandshakeResp>();
pub const COOKIE_REPLY_LEN: usize = core::mem::size_of::<CookieReply>();
pub const TRANSPORT_HEADER_LEN: usize = core::mem::size_of::<TransportHeader>();

pub type Mac = [u8; 16];

/// All handshake-message AEAD seals use nonce zero; uniqueness comes
/// from the chaining key already mixed into the AEAD key at that point.
fn zero_nonce() -> Nonce {
    Nonce::default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptError;

#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct Tag(pub Mac);

#[derive(Clone, Copy, Default, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct Cookie(pub Mac);

macro_rules! encrypted {
    ($name:ident, $n:literal) => {
        #[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
        #[repr(C)]
        pub struct $name {
            pub msg: [u8; $n],
            pub tag: Tag,
        }

        impl $name {
            /// Seal `msg` under `key`, using `aad` as associated data.
            /// Caller is responsible for mixing `aad` and the resulting
            /// ciphertext into the handshake transcript hash.
            pub fn encrypt(mut msg: [u8; $n], key: &Key, aad: &[u8]) -> Self {
                let tag = ChaCha20Poly1305::new(key)
                    .encrypt_in_place_detached(&zero_nonce(), aad, &mut msg)
                    .expect("handshake payloads are far smaller than the AEAD block limit");
                Self {
                    msg,
                    tag: Tag(tag.into()),
                }
            }

            pub fn decrypt(&mut self, key: &Key, aad: &[u8]) -> Result<&[u8; $n], DecryptError> {
                ChaCha20Poly1305::new(key)
                    .decrypt_in_place_detached(&zero_nonce(), aad, &mut self.msg, (&self.tag.0).into())
                    .map_err(|_| DecryptError)?;
                Ok(&self.msg)
            }
        }
    };
}

encrypted!(EncryptedEmpty, 0);
encrypted!(EncryptedTimestamp, 12);
encrypted!(EncryptedPublicKey, 32);

#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct EncryptedCookie {
    pub msg: Cookie,
    pub tag: Tag,
}

impl EncryptedCookie {
    pub fn encrypt(mut cookie: Cookie, key: &Key, nonce: &XNonce, aad: &[u8]) -> Self {
        let tag = XChaCha20Poly1305::new(key)
            .encrypt_in_place_detached(nonce, aad, &mut cookie.0)
            .expect("cookie is a single 16-byte AEAD block");
        Self {
            msg: cookie,
            tag: Tag(tag.into()),
        }
    }

    pub fn decrypt(&mut self, key: &Key, nonce: &XNonce, aad: &[u8]) -> Result<&Cookie, DecryptError> {
        XChaCha20Poly1305::new(key)
            .decrypt_in_place_detached(nonce, aad, &mut self.msg.0, (&self.tag.0).into())
            .map_err(|_| DecryptError)?;
        Ok(&self.msg)
    }
}

/// Initiation: I -> R. 148 bytes on the wire (spec §6).
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct HandshakeInit {
    pub message_type: U32,
    pub sender_index: U32,
    pub unencrypted_ephemeral: [u8; 32],
    pub encrypted_static: EncryptedPublicKey,
    pub encrypted_timestamp: EncryptedTimestamp,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// Response: R -> I. 92 bytes on the wire.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct HandshakeResp {
    pub message_type: U32,
    pub sender_index: U32,
    pub receiver_index: U32,
    pub unencrypted_ephemeral: [u8; 32],
    pub encrypted_nothing: EncryptedEmpty,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// Cookie reply: R -> I, sent instead of a response under load. 64 bytes.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct CookieReply {
    pub message_type: U32,
    pub receiver_index: U32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: EncryptedCookie,
}

/// Transport data header; the ciphertext and 16-byte tag follow in the
/// datagram but are not part of this fixed-size struct since their
/// length is the padded plaintext length.
#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct TransportHeader {
    pub message_type: U32,
    pub receiver_index: U32,
    pub counter: U64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes_match_spec() {
        assert_eq!(INITIATION_LEN, 148);
        assert_eq!(RESPONSE_LEN, 92);
        assert_eq!(COOKIE_REPLY_LEN, 64);
        assert_eq!(TRANSPORT_HEADER_LEN, 16);
    }

    #[test]
    fn encrypted_public_key_round_trips() {
        let key = Key::from([7u8; 32]);
        let aad = b"associated data";
        let pk = [9u8; 32];
        let mut enc = EncryptedPublicKey::encrypt(pk, &key, aad);
        let out = enc.decrypt(&key, aad).unwrap();
        assert_eq!(*out, pk);
    }

    #[test]
    fn encrypted_public_key_rejects_tampered_aad() {
        let key = Key::from([7u8; 32]);
        let mut enc = EncryptedPublicKey::encrypt([9u8; 32], &key, b"aad-one");
        assert!(enc.decrypt(&key, b"aad-two").is_err());
    }

    #[test]
    fn encrypted_cookie_round_trips() {
        let key = Key::from([3u8; 32]);
        let nonce = XNonce::default();
        let cookie = Cookie([4u8; 16]);
        let mut enc = EncryptedCookie::encrypt(cookie, &key, &nonce, b"mac1");
        let out = enc.decrypt(&key, &nonce, b"mac1").unwrap();
        assert_eq!(out.0, cookie.0);
    }
}
