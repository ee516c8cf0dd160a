//! Ebbtide Core - BitTorrent client engine
//!
//! This crate provides the protocol core of a BitTorrent client: a
//! span-preserving bencode codec, torrent metainfo parsing, HTTP tracker
//! communication with BEP 12 tier fallback, the peer wire protocol, and the
//! piece download/verification pipeline, all behind an async
//! [`TorrentEngine`] facade. Persistent storage and the tracker HTTP
//! transport are collaborators supplied by the embedder.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::EbbtideConfig;
pub use storage::{ByteStore, MemoryStore, StorageError};
pub use torrent::{InfoHash, Metainfo, PieceIndex, TorrentEngine, TorrentError};

/// Core errors that can bubble up from any Ebbtide subsystem.
#[derive(Debug, thiserror::Error)]
pub enum EbbtideError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EbbtideError>;
