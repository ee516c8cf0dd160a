//! Known-peer bookkeeping: dedup, numeric ordering and validity tracking.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// A peer reported by a tracker or learned from an inbound handshake.
///
/// Identity is `(ip, port)`; the peer id is informational and ignored by
/// equality and hashing.
#[derive(Debug, Clone, Eq)]
pub struct KnownPeer {
    pub ip: String,
    pub port: u16,
    pub peer_id: Option<Vec<u8>>,
}

impl KnownPeer {
    /// Creates a peer without a known peer id.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            peer_id: None,
        }
    }

    /// Decodes one compact-format record: 4 bytes big-endian IPv4 + 2 bytes
    /// big-endian port.
    pub fn from_compact(record: &[u8; 6]) -> Self {
        let ip = format!("{}.{}.{}.{}", record[0], record[1], record[2], record[3]);
        let port = u16::from_be_bytes([record[4], record[5]]);
        Self::new(ip, port)
    }

    /// Dotted-quad octets as integers, used for numeric ordering. Returns
    /// None for addresses that are not IPv4 dotted-quads.
    fn octets(&self) -> Option<[u8; 4]> {
        let mut octets = [0u8; 4];
        let mut parts = self.ip.split('.');
        for octet in &mut octets {
            *octet = parts.next()?.parse().ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(octets)
    }
}

impl PartialEq for KnownPeer {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Hash for KnownPeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl Ord for KnownPeer {
    /// Ascending numerical order: dotted-quad octets compared as four
    /// integers, most significant first, then port. "127.0.0.2" sorts before
    /// "127.0.0.100" even though the strings compare the other way.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.octets(), other.octets()) {
            (Some(a), Some(b)) => a.cmp(&b).then(self.port.cmp(&other.port)),
            // Non-dotted-quad addresses (hostnames) fall back to string order.
            (None, None) => self.ip.cmp(&other.ip).then(self.port.cmp(&other.port)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for KnownPeer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct PeerEntry {
    peer: KnownPeer,
    valid: bool,
}

/// Per-torrent registry of known peers.
///
/// Invalidated peers are tombstoned rather than erased: they vanish from all
/// listings but stay in the table, and only a fresh announce that re-reports
/// them makes them valid again.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    entries: HashMap<(String, u16), PeerEntry>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges freshly announced peers into the registry, marking each valid.
    ///
    /// The update is a union: existing peers stay, duplicates collapse onto
    /// their `(ip, port)` key, and a known peer id is preserved unless the
    /// new report carries one.
    pub fn insert_all(&mut self, peers: impl IntoIterator<Item = KnownPeer>) {
        for peer in peers {
            let key = (peer.ip.clone(), peer.port);
            match self.entries.get_mut(&key) {
                Some(entry) => {
                    entry.valid = true;
                    if peer.peer_id.is_some() {
                        entry.peer.peer_id = peer.peer_id;
                    }
                }
                None => {
                    self.entries.insert(key, PeerEntry { peer, valid: true });
                }
            }
        }
    }

    /// Invalidates a peer. No-op if the peer is unknown or already invalid.
    pub fn invalidate(&mut self, peer: &KnownPeer) {
        if let Some(entry) = self.entries.get_mut(&(peer.ip.clone(), peer.port)) {
            entry.valid = false;
        }
    }

    /// Returns whether the peer is known and currently valid.
    pub fn is_valid(&self, peer: &KnownPeer) -> bool {
        self.entries
            .get(&(peer.ip.clone(), peer.port))
            .is_some_and(|entry| entry.valid)
    }

    /// Records the peer id learned from a handshake with this peer.
    pub fn record_peer_id(&mut self, ip: &str, port: u16, peer_id: Vec<u8>) {
        if let Some(entry) = self.entries.get_mut(&(ip.to_string(), port)) {
            entry.peer.peer_id = Some(peer_id);
        }
    }

    /// Returns all valid peers in ascending numerical order, without
    /// duplicates.
    pub fn known_peers(&self) -> Vec<KnownPeer> {
        let mut peers: Vec<KnownPeer> = self
            .entries
            .values()
            .filter(|entry| entry.valid)
            .map(|entry| entry.peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Number of entries including tombstones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no peer was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_ordering_beats_lexicographic() {
        let mut registry = PeerRegistry::new();
        registry.insert_all([
            KnownPeer::new("127.0.0.100", 6881),
            KnownPeer::new("127.0.0.2", 6881),
        ]);
        let peers = registry.known_peers();
        assert_eq!(peers[0].ip, "127.0.0.2");
        assert_eq!(peers[1].ip, "127.0.0.100");
    }

    #[test]
    fn test_ordering_most_significant_octet_first() {
        let mut registry = PeerRegistry::new();
        registry.insert_all([
            KnownPeer::new("100.0.0.1", 1),
            KnownPeer::new("22.0.0.1", 1),
            KnownPeer::new("3.0.0.1", 1),
        ]);
        let peers = registry.known_peers();
        let ips: Vec<&str> = peers.iter().map(|peer| peer.ip.as_str()).collect();
        assert_eq!(ips, vec!["3.0.0.1", "22.0.0.1", "100.0.0.1"]);
    }

    #[test]
    fn test_port_breaks_ties() {
        let mut registry = PeerRegistry::new();
        registry.insert_all([
            KnownPeer::new("10.0.0.1", 6999),
            KnownPeer::new("10.0.0.1", 6881),
        ]);
        let peers = registry.known_peers();
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].port, 6999);
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut registry = PeerRegistry::new();
        registry.insert_all([
            KnownPeer::new("10.0.0.1", 6881),
            KnownPeer::new("10.0.0.1", 6881),
        ]);
        registry.insert_all([KnownPeer::new("10.0.0.1", 6881)]);
        assert_eq!(registry.known_peers().len(), 1);
    }

    #[test]
    fn test_invalidation_is_idempotent() {
        let mut registry = PeerRegistry::new();
        let peer = KnownPeer::new("10.0.0.1", 6881);
        registry.insert_all([peer.clone()]);

        registry.invalidate(&peer);
        assert!(registry.known_peers().is_empty());

        // Already invalid and unknown peers are both no-ops.
        registry.invalidate(&peer);
        registry.invalidate(&KnownPeer::new("192.168.0.9", 1));
        assert!(registry.known_peers().is_empty());
    }

    #[test]
    fn test_fresh_announce_revalidates() {
        let mut registry = PeerRegistry::new();
        let peer = KnownPeer::new("10.0.0.1", 6881);
        registry.insert_all([peer.clone()]);
        registry.invalidate(&peer);
        assert!(!registry.is_valid(&peer));

        registry.insert_all([peer.clone()]);
        assert!(registry.is_valid(&peer));
        assert_eq!(registry.known_peers().len(), 1);
    }

    #[test]
    fn test_peer_id_is_not_identity() {
        let mut with_id = KnownPeer::new("10.0.0.1", 6881);
        with_id.peer_id = Some(b"-EB0001-000000000000".to_vec());
        let without_id = KnownPeer::new("10.0.0.1", 6881);
        assert_eq!(with_id, without_id);
    }

    #[test]
    fn test_compact_record_decoding() {
        let peer = KnownPeer::from_compact(&[127, 0, 0, 22, 0x1a, 0xe7]);
        assert_eq!(peer.ip, "127.0.0.22");
        assert_eq!(peer.port, 6887);
    }

    #[test]
    fn test_recorded_peer_id_survives_plain_reinsert() {
        let mut registry = PeerRegistry::new();
        registry.insert_all([KnownPeer::new("10.0.0.1", 6881)]);
        registry.record_peer_id("10.0.0.1", 6881, b"-XX0001-aaaaaaaaaaaa".to_vec());

        registry.insert_all([KnownPeer::new("10.0.0.1", 6881)]);
        let peers = registry.known_peers();
        assert_eq!(
            peers[0].peer_id.as_deref(),
            Some(b"-XX0001-aaaaaaaaaaaa".as_slice())
        );
    }
}
