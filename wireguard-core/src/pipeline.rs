//! The packet pipeline (spec §4.6): worker pools that turn staged
//! plaintext frames into datagrams and datagrams back into frames,
//! plus the reorder buffers that restore sequence order across a pool
//! whose workers can finish in any order.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;

use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, Key, KeyInit};
use crossbeam_channel::{bounded, Receiver, Sender};
use wireguard_types::{TransportHeader, TRANSPORT_HEADER_LEN};
use zerocopy::AsBytes;

use crate::index::PeerId;

/// Block size plaintext is padded to before encryption (spec §4.6).
pub const PADDING_BLOCK_SIZE: usize = 16;

fn padded_len(n: usize) -> usize {
    let rem = n % PADDING_BLOCK_SIZE;
    if rem == 0 {
        n
    } else {
        n + (PADDING_BLOCK_SIZE - rem)
    }
}

fn transport_nonce(counter: u64) -> chacha20poly1305::Nonce {
    let mut nonce = chacha20poly1305::Nonce::default();
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

pub struct EncryptJob {
    pub peer: PeerId,
    pub seq: u64,
    pub endpoint: SocketAddr,
    pub receiver_index: u32,
    pub nonce_counter: u64,
    pub key: [u8; 32],
    pub plaintext: Vec<u8>,
}

pub struct EncryptResult {
    pub peer: PeerId,
    pub seq: u64,
    pub endpoint: SocketAddr,
    pub datagram: Vec<u8>,
}

pub struct DecryptJob {
    pub peer: PeerId,
    /// The encrypted nonce is the ordering key for the inbound reorder
    /// buffer (spec §4.6: "per-peer ordered-receive queue keyed by the
    /// encrypted nonce").
    pub seq: u64,
    pub key: [u8; 32],
    pub ciphertext_and_tag: Vec<u8>,
}

pub struct DecryptResult {
    pub peer: PeerId,
    pub seq: u64,
    /// `None` means the AEAD tag failed to verify; the caller counts
    /// it as an authentication failure and drops it, never panics.
    pub plaintext: Option<Vec<u8>>,
}

/// Single-shot encryption for callers that already have a free thread
/// (e.g. the device's own call stack) and don't need pool batching.
pub fn encrypt_one(job: EncryptJob) -> EncryptResult {
    encrypt_one_inner(job)
}

/// Single-shot decryption; see `encrypt_one`.
pub fn decrypt_one(job: DecryptJob) -> DecryptResult {
    decrypt_one_inner(job)
}

fn encrypt_one_inner(job: EncryptJob) -> EncryptResult {
    let padded = padded_len(job.plaintext.len());
    let mut buf = job.plaintext;
    buf.resize(padded, 0);

    let cipher = ChaCha20Poly1305::new(&Key::from(job.key));
    let tag = cipher
        .encrypt_in_place_detached(&transport_nonce(job.nonce_counter), b"", &mut buf)
        .expect("chacha20poly1305 encryption is infallible for in-bounds buffers");

    let header = TransportHeader {
        message_type: wireguard_types::MSG_TRANSPORT.into(),
        receiver_index: job.receiver_index.into(),
        counter: job.nonce_counter.into(),
    };

    let mut datagram = Vec::with_capacity(TRANSPORT_HEADER_LEN + buf.len() + 16);
    datagram.extend_from_slice(header.as_bytes());
    datagram.extend_from_slice(&buf);
    datagram.extend_from_slice(tag.as_slice());

    EncryptResult {
        peer: job.peer,
        seq: job.seq,
        endpoint: job.endpoint,
        datagram,
    }
}

fn decrypt_one_inner(job: DecryptJob) -> DecryptResult {
    if job.ciphertext_and_tag.len() < 16 {
        return DecryptResult {
            peer: job.peer,
            seq: job.seq,
            plaintext: None,
        };
    }
    let split = job.ciphertext_and_tag.len() - 16;
    let mut buf = job.ciphertext_and_tag[..split].to_vec();
    let mut tag_bytes = [0u8; 16];
    tag_bytes.copy_from_slice(&job.ciphertext_and_tag[split..]);

    let cipher = ChaCha20Poly1305::new(&Key::from(job.key));
    let plaintext = cipher
        .decrypt_in_place_detached(&transport_nonce(job.seq), b"", &mut buf, (&tag_bytes).into())
        .is_ok()
        .then_some(buf);

    DecryptResult {
        peer: job.peer,
        seq: job.seq,
        plaintext,
    }
}

/// A fixed-size thread pool shared by every peer (spec §4.6's "worker
/// pools sized to the available parallelism"); workers are stateless
/// with respect to ordering, so any worker may process any job.
pub struct WorkerPool<J, R> {
    jobs_tx: Sender<J>,
    results_rx: Receiver<R>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl<J, R> WorkerPool<J, R>
where
    J: Send + 'static,
    R: Send + 'static,
{
    fn spawn(threads: usize, queue_depth: usize, work: fn(J) -> R) -> Self {
        let (jobs_tx, jobs_rx) = bounded::<J>(queue_depth);
        let (results_tx, results_rx) = bounded::<R>(queue_depth);
        let handles = (0..threads.max(1))
            .map(|_| {
                let jobs_rx = jobs_rx.clone();
                let results_tx = results_tx.clone();
                std::thread::spawn(move || {
                    while let Ok(job) = jobs_rx.recv() {
                        if results_tx.send(work(job)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        Self {
            jobs_tx,
            results_rx,
            handles,
        }
    }

    pub fn submit(&self, job: J) -> Result<(), crossbeam_channel::TrySendError<J>> {
        self.jobs_tx.try_send(job)
    }

    pub fn results(&self) -> &Receiver<R> {
        &self.results_rx
    }

    /// Drops the job sender, which unblocks every worker's `recv` and
    /// lets them exit (spec §5's cooperative shutdown via a shared
    /// closed-channel signal).
    pub fn shutdown(self) {
        drop(self.jobs_tx);
        for h in self.handles {
            let _ = h.join();
        }
    }
}

pub fn encrypt_pool(threads: usize, queue_depth: usize) -> WorkerPool<EncryptJob, EncryptResult> {
    WorkerPool::spawn(threads, queue_depth, encrypt_one)
}

pub fn decrypt_pool(threads: usize, queue_depth: usize) -> WorkerPool<DecryptJob, DecryptResult> {
    WorkerPool::spawn(threads, queue_depth, decrypt_one)
}

struct Ticket<T> {
    seq: u64,
    item: T,
}

impl<T> PartialEq for Ticket<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl<T> Eq for Ticket<T> {}
impl<T> PartialOrd for Ticket<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Ticket<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so `BinaryHeap` (a max-heap) pops the smallest seq
        // first, giving us a min-heap keyed on sequence number.
        other.seq.cmp(&self.seq)
    }
}

/// Buffers out-of-order worker results and releases them in strict
/// sequence order (spec §4.6's ordered-transmit / ordered-receive
/// queues). Ordering invariant: `drain_ready` only ever yields items
/// in increasing, contiguous `seq` order starting from `next_seq`.
pub struct ReorderBuffer<T> {
    next_seq: u64,
    heap: BinaryHeap<Ticket<T>>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(start_seq: u64) -> Self {
        Self {
            next_seq: start_seq,
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, seq: u64, item: T) {
        self.heap.push(Ticket { seq, item });
    }

    /// Pops and returns every item now ready to release, in order.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.seq != self.next_seq {
                break;
            }
            let Ticket { item, .. } = self.heap.pop().unwrap();
            ready.push(item);
            self.next_seq += 1;
        }
        ready
    }

    pub fn pending(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let key = [7u8; 32];
        let enc = encrypt_one(EncryptJob {
            peer: 0,
            seq: 0,
            endpoint: "127.0.0.1:1".parse().unwrap(),
            receiver_index: 42,
            nonce_counter: 0,
            key,
            plaintext: b"hello peer".to_vec(),
        });

        let body = &enc.datagram[TRANSPORT_HEADER_LEN..];
        let dec = decrypt_one(DecryptJob {
            peer: 0,
            seq: 0,
            key,
            ciphertext_and_tag: body.to_vec(),
        });
        let plaintext = dec.plaintext.unwrap();
        assert_eq!(&plaintext[..b"hello peer".len()], b"hello peer");
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let key = [7u8; 32];
        let enc = encrypt_one(EncryptJob {
            peer: 0,
            seq: 0,
            endpoint: "127.0.0.1:1".parse().unwrap(),
            receiver_index: 42,
            nonce_counter: 0,
            key,
            plaintext: b"hello peer".to_vec(),
        });
        let mut body = enc.datagram[TRANSPORT_HEADER_LEN..].to_vec();
        body[0] ^= 1;
        let dec = decrypt_one(DecryptJob {
            peer: 0,
            seq: 0,
            key,
            ciphertext_and_tag: body,
        });
        assert!(dec.plaintext.is_none());
    }

    #[test]
    fn reorder_buffer_releases_only_contiguous_prefix() {
        let mut buf = ReorderBuffer::new(0);
        buf.push(2, "c");
        buf.push(0, "a");
        assert_eq!(buf.drain_ready(), vec!["a"]);
        buf.push(1, "b");
        assert_eq!(buf.drain_ready(), vec!["b", "c"]);
    }
}
