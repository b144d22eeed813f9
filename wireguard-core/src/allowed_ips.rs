//! Longest-prefix-match routing table from inner IP to peer (spec
//! §3 "Allowed-IPs trie", §4.2). A binary radix tree keyed by the bits
//! of the destination address; IPv4 and IPv6 get separate trees since
//! their bit widths differ. Lookup walks from the root tracking the
//! peer of the deepest node visited so far — since a node can only
//! exist along a path that was actually inserted, the last peer seen
//! while descending is, by construction, the longest matching prefix.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::index::PeerId;

struct Node {
    children: [Option<Box<Node>>; 2],
    peer: Option<PeerId>,
}

impl Node {
    fn empty() -> Self {
        Self {
            children: [None, None],
            peer: None,
        }
    }

    fn is_empty_leaf(&self) -> bool {
        self.peer.is_none() && self.children[0].is_none() && self.children[1].is_none()
    }
}

fn bit_at(bytes: &[u8], i: usize) -> usize {
    ((bytes[i / 8] >> (7 - i % 8)) & 1) as usize
}

/// A single-family radix trie. `AllowedIps` below wraps one of these
/// per address family.
struct Trie {
    root: Node,
}

impl Trie {
    fn new() -> Self {
        Self { root: Node::empty() }
    }

    fn insert(&mut self, addr: &[u8], prefix_len: usize, peer: PeerId) {
        let mut node = &mut self.root;
        for i in 0..prefix_len {
            let bit = bit_at(addr, i);
            node = node.children[bit].get_or_insert_with(|| Box::new(Node::empty()));
        }
        // On a tie (re-inserting the same prefix), the most recent
        // insert wins — we just overwrite.
        node.peer = Some(peer);
    }

    fn lookup(&self, addr: &[u8], bits: usize) -> Option<PeerId> {
        let mut node = &self.root;
        let mut best = node.peer;
        for i in 0..bits {
            let bit = bit_at(addr, i);
            match &node.children[bit] {
                Some(next) => {
                    node = next;
                    if node.peer.is_some() {
                        best = node.peer;
                    }
                }
                None => break,
            }
        }
        best
    }

    fn remove_exact(&mut self, addr: &[u8], prefix_len: usize) {
        Self::remove_exact_rec(&mut self.root, addr, prefix_len, 0);
    }

    /// Returns `true` if the node at this level became an empty leaf
    /// and can be pruned by the caller.
    fn remove_exact_rec(node: &mut Node, addr: &[u8], prefix_len: usize, depth: usize) -> bool {
        if depth == prefix_len {
            node.peer = None;
            return node.is_empty_leaf();
        }
        let bit = bit_at(addr, depth);
        let Some(child) = node.children[bit].as_mut() else {
            return false;
        };
        if Self::remove_exact_rec(child, addr, prefix_len, depth + 1) {
            node.children[bit] = None;
        }
        node.is_empty_leaf()
    }

    fn remove_by_peer(&mut self, peer: PeerId) {
        Self::remove_by_peer_rec(&mut self.root, peer);
    }

    fn remove_by_peer_rec(node: &mut Node, peer: PeerId) -> bool {
        if node.peer == Some(peer) {
            node.peer = None;
        }
        for slot in &mut node.children {
            if let Some(child) = slot {
                if Self::remove_by_peer_rec(child, peer) {
                    *slot = None;
                }
            }
        }
        node.is_empty_leaf()
    }
}

/// The full routing table: one trie for IPv4, one for IPv6, matching
/// spec §3's "separate tries for IPv4 and IPv6" invariant.
pub struct AllowedIps {
    v4: Trie,
    v6: Trie,
}

impl Default for AllowedIps {
    fn default() -> Self {
        Self::new()
    }
}

impl AllowedIps {
    pub fn new() -> Self {
        Self {
            v4: Trie::new(),
            v6: Trie::new(),
        }
    }

    pub fn insert_v4(&mut self, addr: Ipv4Addr, prefix_len: u8, peer: PeerId) {
        self.v4.insert(&addr.octets(), prefix_len as usize, peer);
    }

    pub fn insert_v6(&mut self, addr: Ipv6Addr, prefix_len: u8, peer: PeerId) {
        self.v6.insert(&addr.octets(), prefix_len as usize, peer);
    }

    pub fn lookup_v4(&self, addr: Ipv4Addr) -> Option<PeerId> {
        self.v4.lookup(&addr.octets(), 32)
    }

    pub fn lookup_v6(&self, addr: Ipv6Addr) -> Option<PeerId> {
        self.v6.lookup(&addr.octets(), 128)
    }

    pub fn lookup(&self, addr: IpAddr) -> Option<PeerId> {
        match addr {
            IpAddr::V4(a) => self.lookup_v4(a),
            IpAddr::V6(a) => self.lookup_v6(a),
        }
    }

    /// Does `peer`'s routing include `addr`? Used for the inbound
    /// reverse-path check (spec §4.6: "drop if the source IP in the
    /// inner packet is not routable to the authenticated peer").
    pub fn peer_owns(&self, peer: PeerId, addr: IpAddr) -> bool {
        self.lookup(addr) == Some(peer)
    }

    pub fn remove_exact_v4(&mut self, addr: Ipv4Addr, prefix_len: u8) {
        self.v4.remove_exact(&addr.octets(), prefix_len as usize);
    }

    pub fn remove_exact_v6(&mut self, addr: Ipv6Addr, prefix_len: u8) {
        self.v6.remove_exact(&addr.octets(), prefix_len as usize);
    }

    pub fn remove_by_peer(&mut self, peer: PeerId) {
        self.v4.remove_by_peer(peer);
        self.v6.remove_by_peer(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut ips = AllowedIps::new();
        ips.insert_v4("10.0.0.0".parse().unwrap(), 8, 1);
        ips.insert_v4("10.1.0.0".parse().unwrap(), 16, 2);
        assert_eq!(ips.lookup_v4("10.1.2.3".parse().unwrap()), Some(2));
        assert_eq!(ips.lookup_v4("10.2.2.3".parse().unwrap()), Some(1));
    }

    #[test]
    fn removing_more_specific_falls_back() {
        let mut ips = AllowedIps::new();
        ips.insert_v4("10.0.0.0".parse().unwrap(), 8, 1);
        ips.insert_v4("10.1.0.0".parse().unwrap(), 16, 2);
        ips.remove_exact_v4("10.1.0.0".parse().unwrap(), 16);
        assert_eq!(ips.lookup_v4("10.1.2.3".parse().unwrap()), Some(1));
        ips.remove_exact_v4("10.0.0.0".parse().unwrap(), 8);
        assert_eq!(ips.lookup_v4("10.1.2.3".parse().unwrap()), None);
    }

    #[test]
    fn remove_by_peer_drops_every_prefix() {
        let mut ips = AllowedIps::new();
        ips.insert_v4("192.168.4.28".parse().unwrap(), 32, 7);
        ips.insert_v6("fd00::1".parse().unwrap(), 128, 7);
        ips.remove_by_peer(7);
        assert_eq!(ips.lookup_v4("192.168.4.28".parse().unwrap()), None);
        assert_eq!(ips.lookup_v6("fd00::1".parse().unwrap()), None);
    }

    #[test]
    fn no_match_returns_none() {
        let ips = AllowedIps::new();
        assert_eq!(ips.lookup_v4("1.2.3.4".parse().unwrap()), None);
    }

    #[test]
    fn single_host_route_does_not_shadow_sibling() {
        let mut ips = AllowedIps::new();
        ips.insert_v4("192.168.4.28".parse().unwrap(), 32, 1);
        ips.insert_v4("192.168.4.29".parse().unwrap(), 32, 2);
        assert_eq!(ips.lookup_v4("192.168.4.28".parse().unwrap()), Some(1));
        assert_eq!(ips.lookup_v4("192.168.4.29".parse().unwrap()), Some(2));
        assert_eq!(ips.lookup_v4("192.168.4.30".parse().unwrap()), None);
    }

    proptest::proptest! {
        /// Inserting a `/32` host route and then looking up that exact
        /// address must always find it, no matter what else shares the
        /// trie (spec §3's longest-prefix-match invariant in its most
        /// basic form).
        #[test]
        fn exact_host_route_always_found(a in 0u8..255, b in 0u8..255, c in 0u8..255, d in 0u8..255) {
            let addr = Ipv4Addr::new(a, b, c, d);
            let mut ips = AllowedIps::new();
            ips.insert_v4(addr, 32, 42);
            proptest::prop_assert_eq!(ips.lookup_v4(addr), Some(42));
        }

        /// Removing a route by exact prefix makes every address that
        /// route covered unreachable (assuming no less-specific route
        /// still covers them).
        #[test]
        fn remove_exact_then_lookup_misses(a in 0u8..255, b in 0u8..255) {
            let net_addr = Ipv4Addr::new(a, b, 0, 0);
            let mut ips = AllowedIps::new();
            ips.insert_v4(net_addr, 16, 7);
            ips.remove_exact_v4(net_addr, 16);
            proptest::prop_assert_eq!(ips.lookup_v4(Ipv4Addr::new(a, b, 1, 1)), None);
        }
    }
}
