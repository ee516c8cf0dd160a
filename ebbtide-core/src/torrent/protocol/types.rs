//! Core types for the BitTorrent wire protocol.

use bytes::Bytes;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::config::TorrentConfig;
use crate::torrent::{InfoHash, PieceIndex};

/// BitTorrent peer identifier.
///
/// 20 bytes: an eight-byte client prefix, six hex characters derived from a
/// fixed seed, and six random alphanumeric characters chosen once per engine
/// instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates a peer id from a 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns the peer id as a byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates this client's peer id from the configured prefix and seed.
    pub fn generate(config: &TorrentConfig) -> Self {
        debug_assert_eq!(config.client_prefix.len(), 8);
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(config.client_prefix.as_bytes());

        // Six hex chars of the seed digest, then six random alphanumerics.
        let digest = Sha1::digest(config.peer_id_seed.as_bytes());
        id[8..14].copy_from_slice(hex::encode(&digest[..3]).as_bytes());

        let mut rng = rand::rng();
        for byte in &mut id[14..] {
            *byte = rng.sample(rand::distr::Alphanumeric);
        }
        Self(id)
    }
}

/// BitTorrent wire protocol messages recognized by this engine.
///
/// Everything except keep-alive is framed as
/// `<4-byte big-endian length><1-byte id><payload>`; keep-alive is four zero
/// bytes. Ids outside 0-7 are protocol violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep-alive message to maintain the connection
    KeepAlive,
    /// Inform the peer that we are choking it
    Choke,
    /// Inform the peer that we are no longer choking it
    Unchoke,
    /// Inform the peer that we want pieces it has
    Interested,
    /// Inform the peer that we want nothing it has
    NotInterested,
    /// Inform the peer that we acquired a piece
    Have { piece_index: PieceIndex },
    /// Our complete piece availability bitmap, MSB-first within each byte
    Bitfield { bitfield: Bytes },
    /// Request a block of data from a piece
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// A block of piece data
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
}

/// Peer handshake contents.
///
/// Serialized as exactly 68 bytes: `0x13`, the literal
/// `"BitTorrent protocol"`, eight reserved zero bytes, the info-hash and the
/// peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHandshake {
    /// Reserved bytes; always zero in this engine
    pub reserved: [u8; 8],
    /// Info-hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Identifier of the sending peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Creates a handshake with zeroed reserved bytes.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}
