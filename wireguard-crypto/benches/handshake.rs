//! Matches the teacher's `divan`-based micro-benchmarks: how many
//! handshakes per second a single core can process, split by side.

use rand::rngs::OsRng;
use tai64::Tai64N;
use wireguard_crypto::{
    decrypt_handshake_init, encrypt_handshake_init, PublicKey, StaticInitiatorConfig,
    StaticPeerConfig, StaticSecret,
};

fn main() {
    divan::main();
}

fn setup() -> (StaticInitiatorConfig, StaticInitiatorConfig, StaticPeerConfig, [u8; 32]) {
    let i_sk = StaticSecret::random_from_rng(OsRng);
    let r_sk = StaticSecret::random_from_rng(OsRng);
    let i_pk = PublicKey::from(&i_sk);
    let r_pk = PublicKey::from(&r_sk);
    let ss = r_sk.diffie_hellman(&i_pk).to_bytes();
    (
        StaticInitiatorConfig::new(i_sk),
        StaticInitiatorConfig::new(r_sk),
        StaticPeerConfig::new(r_pk, None),
        ss,
    )
}

#[divan::bench]
fn create_initiation(bencher: divan::Bencher) {
    let (initiator, _responder, peer, _ss) = setup();
    bencher.bench(|| {
        let esk_i = StaticSecret::random_from_rng(OsRng);
        encrypt_handshake_init(&initiator, &peer, &esk_i, Tai64N::now(), 1, None)
    });
}

#[divan::bench]
fn consume_initiation(bencher: divan::Bencher) {
    let (initiator, responder, peer, ss) = setup();
    let esk_i = StaticSecret::random_from_rng(OsRng);
    bencher.bench_local(|| {
        let (mut msg, _hs) =
            encrypt_handshake_init(&initiator, &peer, &esk_i, Tai64N::now(), 1, None);
        decrypt_handshake_init(&mut msg, &responder, |_| Some((ss, [0; 32]))).unwrap();
    });
}
