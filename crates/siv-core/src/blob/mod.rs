//! Content-addressed blob storage for uploaded documents.
//!
//! Documents are stored under the hex-encoded SHA-256 of their content,
//! which gives:
//! - Content integrity: hash verification on retrieval
//! - Deduplication: identical content is stored only once
//! - Immutability: a key always refers to the same bytes
//!
//! The workflow treats the store as an opaque collaborator behind the
//! [`BlobStore`] trait; [`MemoryBlobStore`] is the in-process reference
//! implementation, and the daemon provides a SQLite-backed one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::ingest::sha256_hex;

/// Errors that can occur during blob operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlobError {
    /// No content stored under the given key.
    #[error("blob not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// Stored content no longer matches its key (corruption).
    #[error("blob integrity failure for {key}: content hashes to {actual}")]
    IntegrityFailure {
        /// The key whose content failed verification.
        key: String,
        /// The hash the stored content actually produced.
        actual: String,
    },

    /// Empty content is not allowed.
    #[error("empty blob is not allowed")]
    EmptyContent,

    /// Backend fault (I/O, database).
    #[error("blob storage error: {0}")]
    Backend(String),
}

/// Opaque, content-addressed document storage.
pub trait BlobStore: Send + Sync {
    /// Stores `content` and returns its key (hex SHA-256). Storing the same
    /// content twice is a deduplicated no-op returning the same key.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::EmptyContent`] for empty input or
    /// [`BlobError::Backend`] on storage faults.
    fn put(&self, content: &[u8]) -> Result<String, BlobError>;

    /// Retrieves content by key, verifying it against the key first.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::NotFound`] for unknown keys and
    /// [`BlobError::IntegrityFailure`] when stored bytes no longer hash to
    /// the key.
    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;

    /// Whether content exists under the given key.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Backend`] on storage faults.
    fn exists(&self, key: &str) -> Result<bool, BlobError>;
}

/// In-memory blob store.
#[derive(Debug, Default, Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (indicates a thread panic).
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (indicates a thread panic).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().expect("lock poisoned").is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, content: &[u8]) -> Result<String, BlobError> {
        if content.is_empty() {
            return Err(BlobError::EmptyContent);
        }
        let key = sha256_hex(content);
        self.blobs
            .write()
            .expect("lock poisoned")
            .entry(key.clone())
            .or_insert_with(|| content.to_vec());
        Ok(key)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let blobs = self.blobs.read().expect("lock poisoned");
        let content = blobs.get(key).ok_or_else(|| BlobError::NotFound {
            key: key.to_string(),
        })?;

        let actual = sha256_hex(content);
        if actual != key {
            return Err(BlobError::IntegrityFailure {
                key: key.to_string(),
                actual,
            });
        }
        Ok(content.clone())
    }

    fn exists(&self, key: &str) -> Result<bool, BlobError> {
        Ok(self.blobs.read().expect("lock poisoned").contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_round_trip() {
        let store = MemoryBlobStore::new();
        let key = store.put(b"document bytes").unwrap();
        assert_eq!(store.get(&key).unwrap(), b"document bytes");
        assert!(store.exists(&key).unwrap());
    }

    #[test]
    fn test_put_deduplicates() {
        let store = MemoryBlobStore::new();
        let first = store.put(b"same content").unwrap();
        let second = store.put(b"same content").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_content_rejected() {
        let store = MemoryBlobStore::new();
        assert!(matches!(store.put(b""), Err(BlobError::EmptyContent)));
    }

    #[test]
    fn test_get_unknown_key() {
        let store = MemoryBlobStore::new();
        assert!(matches!(
            store.get("deadbeef"),
            Err(BlobError::NotFound { .. })
        ));
    }
}
