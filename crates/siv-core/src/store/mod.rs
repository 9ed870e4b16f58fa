//! Persistence traits for identities and appeals.
//!
//! The identity row is the only mutable shared resource in the workflow,
//! so [`IdentityStore::update`] is an optimistic compare-and-swap on the
//! record's `version` counter: two concurrent transition attempts cannot
//! both succeed, and the loser observes [`StoreError::VersionConflict`]
//! (surfaced to callers as `ConcurrentModification`) and must re-read
//! fresh state. Appeals are append-mostly and only need plain updates;
//! identity-status changes they trigger still go through the identity CAS.
//!
//! In-memory implementations back the core test suite; the daemon provides
//! SQLite-backed ones with the same semantics.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::appeal::Appeal;
use crate::identity::Identity;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No record with the given id.
    #[error("record not found: {id}")]
    NotFound {
        /// The id that was not found.
        id: String,
    },

    /// A record with the given id already exists.
    #[error("record already exists: {id}")]
    AlreadyExists {
        /// The conflicting id.
        id: String,
    },

    /// Lost the optimistic-concurrency race: the stored version moved on.
    #[error("version conflict for {id}: expected {expected}, stored {stored}")]
    VersionConflict {
        /// The record id.
        id: String,
        /// The version the caller read.
        expected: u64,
        /// The version currently stored.
        stored: u64,
    },

    /// Backend fault (I/O, database).
    #[error("store error: {0}")]
    Backend(String),
}

/// Versioned persistence for [`Identity`] records.
pub trait IdentityStore: Send + Sync {
    /// Inserts a freshly registered identity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the id is taken.
    fn insert(&self, identity: &Identity) -> Result<(), StoreError>;

    /// Fetches an identity by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    fn get(&self, id: &str) -> Result<Identity, StoreError>;

    /// Compare-and-swap update: succeeds only when the stored version
    /// equals `expected_version`, and returns the record with its version
    /// incremented.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] when another writer got
    /// there first, [`StoreError::NotFound`] for unknown ids.
    fn update(&self, identity: &Identity, expected_version: u64) -> Result<Identity, StoreError>;
}

/// Persistence for [`Appeal`] records.
pub trait AppealStore: Send + Sync {
    /// Inserts a new appeal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the id is taken.
    fn insert(&self, appeal: &Appeal) -> Result<(), StoreError>;

    /// Fetches an appeal by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    fn get(&self, id: &str) -> Result<Appeal, StoreError>;

    /// Overwrites an existing appeal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown ids.
    fn update(&self, appeal: &Appeal) -> Result<(), StoreError>;

    /// Returns the open (`pending`/`under_review`) appeal for an identity,
    /// if one exists. At most one can be open at a time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on storage faults.
    fn find_open(&self, identity_id: &str) -> Result<Option<Appeal>, StoreError>;
}

/// In-memory identity store.
#[derive(Debug, Default, Clone)]
pub struct MemoryIdentityStore {
    identities: Arc<RwLock<HashMap<String, Identity>>>,
}

impl MemoryIdentityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn insert(&self, identity: &Identity) -> Result<(), StoreError> {
        let mut identities = self.identities.write().expect("lock poisoned");
        if identities.contains_key(&identity.id) {
            return Err(StoreError::AlreadyExists {
                id: identity.id.clone(),
            });
        }
        identities.insert(identity.id.clone(), identity.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Identity, StoreError> {
        self.identities
            .read()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    fn update(&self, identity: &Identity, expected_version: u64) -> Result<Identity, StoreError> {
        let mut identities = self.identities.write().expect("lock poisoned");
        let stored = identities
            .get_mut(&identity.id)
            .ok_or_else(|| StoreError::NotFound {
                id: identity.id.clone(),
            })?;

        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: identity.id.clone(),
                expected: expected_version,
                stored: stored.version,
            });
        }

        let mut updated = identity.clone();
        updated.version = expected_version + 1;
        *stored = updated.clone();
        Ok(updated)
    }
}

/// In-memory appeal store.
#[derive(Debug, Default, Clone)]
pub struct MemoryAppealStore {
    appeals: Arc<RwLock<HashMap<String, Appeal>>>,
}

impl MemoryAppealStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AppealStore for MemoryAppealStore {
    fn insert(&self, appeal: &Appeal) -> Result<(), StoreError> {
        let mut appeals = self.appeals.write().expect("lock poisoned");
        if appeals.contains_key(&appeal.id) {
            return Err(StoreError::AlreadyExists {
                id: appeal.id.clone(),
            });
        }
        appeals.insert(appeal.id.clone(), appeal.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Appeal, StoreError> {
        self.appeals
            .read()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    fn update(&self, appeal: &Appeal) -> Result<(), StoreError> {
        let mut appeals = self.appeals.write().expect("lock poisoned");
        match appeals.get_mut(&appeal.id) {
            Some(stored) => {
                *stored = appeal.clone();
                Ok(())
            },
            None => Err(StoreError::NotFound {
                id: appeal.id.clone(),
            }),
        }
    }

    fn find_open(&self, identity_id: &str) -> Result<Option<Appeal>, StoreError> {
        Ok(self
            .appeals
            .read()
            .expect("lock poisoned")
            .values()
            .find(|appeal| appeal.identity_id == identity_id && appeal.status.is_open())
            .cloned())
    }
}
