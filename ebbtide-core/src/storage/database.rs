//! Namespaced view over a [`ByteStore`].
//!
//! Keys follow the `"<hash>-<field>"` composite convention; the database
//! stays byte-oriented and leaves encoding to the callers so the storage
//! layer never depends on protocol types.

use std::sync::Arc;

use super::{ByteStore, StorageError};

const NS_TORRENTS: &str = "torrents";
const NS_PEERS: &str = "peers";
const NS_TRACKERS: &str = "trackers";
const NS_STATS: &str = "stats";
const NS_FILES: &str = "files";

/// Composite-keyed database used by the torrent engine.
#[derive(Debug)]
pub struct Database<S: ByteStore> {
    store: Arc<S>,
}

impl<S: ByteStore> Clone for Database<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: ByteStore> Database<S> {
    /// Wraps a byte-store collaborator.
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Returns whether a torrent with this hash is currently loaded.
    pub async fn torrent_exists(&self, hash: &str) -> Result<bool, StorageError> {
        self.store
            .exists(NS_TORRENTS, &format!("{hash}-loaded"))
            .await
    }

    /// Persists a freshly loaded torrent: its raw metainfo bytes and the
    /// encoded announce tiers.
    pub async fn add_torrent(
        &self,
        hash: &str,
        raw: &[u8],
        tiers: &[u8],
    ) -> Result<(), StorageError> {
        self.store
            .write(NS_TORRENTS, &format!("{hash}-raw"), raw)
            .await?;
        self.store
            .write(NS_TORRENTS, &format!("{hash}-announce"), tiers)
            .await?;
        self.store
            .write(NS_TORRENTS, &format!("{hash}-loaded"), b"1")
            .await
    }

    /// Tombstones a torrent's load marker and metainfo fields.
    pub async fn remove_torrent(&self, hash: &str) -> Result<(), StorageError> {
        self.store
            .write(NS_TORRENTS, &format!("{hash}-loaded"), b"")
            .await?;
        self.store
            .write(NS_TORRENTS, &format!("{hash}-raw"), b"")
            .await?;
        self.store
            .write(NS_TORRENTS, &format!("{hash}-announce"), b"")
            .await
    }

    /// Reads the raw metainfo bytes of a loaded torrent.
    pub async fn torrent_raw(&self, hash: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.read(NS_TORRENTS, &format!("{hash}-raw")).await
    }

    /// Reads the encoded announce tiers.
    pub async fn announce_tiers(&self, hash: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.store
            .read(NS_TORRENTS, &format!("{hash}-announce"))
            .await
    }

    /// Overwrites the encoded announce tiers (after a STARTED shuffle).
    pub async fn update_announce_tiers(
        &self,
        hash: &str,
        tiers: &[u8],
    ) -> Result<(), StorageError> {
        self.store
            .write(NS_TORRENTS, &format!("{hash}-announce"), tiers)
            .await
    }

    /// Persists the encoded known-peer snapshot for a torrent.
    pub async fn write_peer_set(&self, hash: &str, peers: &[u8]) -> Result<(), StorageError> {
        self.store.write(NS_PEERS, &format!("{hash}-set"), peers).await
    }

    /// Reads the encoded known-peer snapshot.
    pub async fn peer_set(&self, hash: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.read(NS_PEERS, &format!("{hash}-set")).await
    }

    /// Marks a peer valid (flag write) or invalid (tombstone).
    pub async fn set_peer_validity(
        &self,
        hash: &str,
        ip: &str,
        port: u16,
        valid: bool,
    ) -> Result<(), StorageError> {
        let value: &[u8] = if valid { b"1" } else { b"" };
        self.store
            .write(NS_PEERS, &format!("{hash}-{ip}-{port}"), value)
            .await
    }

    /// Returns whether a peer is currently marked valid.
    pub async fn peer_is_valid(
        &self,
        hash: &str,
        ip: &str,
        port: u16,
    ) -> Result<bool, StorageError> {
        self.store
            .exists(NS_PEERS, &format!("{hash}-{ip}-{port}"))
            .await
    }

    /// Persists the encoded statistics entry for one tracker URL.
    pub async fn write_tracker_stats(
        &self,
        hash: &str,
        url: &str,
        stats: &[u8],
    ) -> Result<(), StorageError> {
        self.store
            .write(NS_TRACKERS, &format!("{hash}-{url}"), stats)
            .await
    }

    /// Reads the encoded statistics entry for one tracker URL.
    pub async fn tracker_stats(
        &self,
        hash: &str,
        url: &str,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.read(NS_TRACKERS, &format!("{hash}-{url}")).await
    }

    /// Persists the encoded cumulative torrent statistics.
    pub async fn write_torrent_stats(&self, hash: &str, stats: &[u8]) -> Result<(), StorageError> {
        self.store.write(NS_STATS, hash, stats).await
    }

    /// Reads the encoded cumulative torrent statistics.
    pub async fn torrent_stats(&self, hash: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.read(NS_STATS, hash).await
    }

    /// Persists one file's contents for a torrent.
    pub async fn write_file(
        &self,
        hash: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), StorageError> {
        self.store
            .write(NS_FILES, &format!("{hash}-{path}"), contents)
            .await
    }

    /// Reads one file's contents; absent files return `None`.
    pub async fn file(&self, hash: &str, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.store.read(NS_FILES, &format!("{hash}-{path}")).await
    }
}
