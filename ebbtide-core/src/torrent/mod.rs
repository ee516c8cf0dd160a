//! BitTorrent protocol engine: bencode, metainfo, trackers, wire protocol,
//! piece pipeline and the session facade.

pub mod bencode;
pub mod downloader;
pub mod engine;
pub mod metainfo;
pub mod peers;
pub mod protocol;
#[cfg(test)]
pub mod test_data;
pub mod tracker;

use std::fmt;

pub use bencode::{BencodeKind, BencodeValue, Span};
pub use downloader::BLOCK_SIZE;
pub use engine::{ConnectedPeer, TorrentEngine, TorrentStats};
pub use metainfo::{Metainfo, TorrentFile};
pub use peers::{KnownPeer, PeerRegistry};
pub use protocol::{HandshakeCodec, MessageCodec, PeerConnection, PeerHandshake, PeerId, PeerMessage};
pub use tracker::{AnnounceEvent, HttpTransport, ScrapeData, TrackerClient, Transport};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 digest of the exact bencoded bytes of the torrent's `info`
/// dictionary. The torrent's primary identifier everywhere in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates an InfoHash from a 20-byte SHA-1 digest.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns a reference to the underlying 20-byte digest.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates a PieceIndex from a zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Local recovery is limited to the tracker tier walk; every other failure
/// propagates to the caller as one of these variants.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Malformed bencode data: {reason}")]
    MalformedEncoding { reason: String },

    #[error("Torrent {info_hash} is not loaded")]
    UnknownTorrent { info_hash: InfoHash },

    #[error("Torrent {info_hash} is already loaded")]
    AlreadyLoaded { info_hash: InfoHash },

    #[error("Every tracker failed: {reason}")]
    TrackerUnreachable { reason: String },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Peer {address} choked mid-transfer")]
    PeerChoked { address: String },

    #[error("Piece {index} hash mismatch")]
    PieceHashMismatch { index: PieceIndex },

    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    #[error("UTF-8 conversion error")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}
