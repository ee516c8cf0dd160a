//! Storage collaborator for the torrent engine.
//!
//! The engine persists torrent bytes, peer validity, tracker statistics and
//! file contents through an opaque async byte-store. The store is keyed by
//! `(namespace, key)`; writing an empty byte string tombstones the key, and
//! tombstoned keys read as absent.

pub mod database;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

pub use database::Database;

/// Async byte-store collaborator.
///
/// Within a session, a read of a key observes the most recent completed
/// write for that key.
#[async_trait]
pub trait ByteStore: Send + Sync {
    /// Returns whether a non-tombstoned value exists for the key.
    ///
    /// # Errors
    ///
    /// - `StorageError::Backend` - If the underlying store failed
    async fn exists(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;

    /// Reads the value for the key; absent and tombstoned keys both return
    /// `None`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Backend` - If the underlying store failed
    async fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Writes the value for the key; an empty value is the tombstone/delete
    /// convention.
    ///
    /// # Errors
    ///
    /// - `StorageError::Backend` - If the underlying store failed
    async fn write(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;
}

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage backend error: {message}")]
    Backend { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// In-memory reference implementation of [`ByteStore`].
///
/// Used by the test suite and by embedders that do not need durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ByteStore for MemoryStore {
    async fn exists(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.read(namespace, key).await?.is_some())
    }

    async fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.entries.read().await;
        let value = entries.get(&(namespace.to_string(), key.to_string()));
        // An empty value is a tombstone.
        Ok(value.filter(|bytes| !bytes.is_empty()).cloned())
    }

    async fn write(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        entries.insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryStore::new();
        store.write("torrents", "abc-raw", b"payload").await.unwrap();
        assert_eq!(
            store.read("torrents", "abc-raw").await.unwrap(),
            Some(b"payload".to_vec())
        );
        assert!(store.exists("torrents", "abc-raw").await.unwrap());
    }

    #[tokio::test]
    async fn test_namespaces_are_disjoint() {
        let store = MemoryStore::new();
        store.write("peers", "key", b"1").await.unwrap();
        assert!(!store.exists("trackers", "key").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_write_tombstones() {
        let store = MemoryStore::new();
        store.write("torrents", "abc-loaded", b"1").await.unwrap();
        store.write("torrents", "abc-loaded", b"").await.unwrap();
        assert!(!store.exists("torrents", "abc-loaded").await.unwrap());
        assert_eq!(store.read("torrents", "abc-loaded").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_observes_latest_write() {
        let store = MemoryStore::new();
        store.write("stats", "abc", b"first").await.unwrap();
        store.write("stats", "abc", b"second").await.unwrap();
        assert_eq!(
            store.read("stats", "abc").await.unwrap(),
            Some(b"second".to_vec())
        );
    }
}
