//! Verification workflow error types.

use thiserror::Error;

use crate::audit::AuditError;
use crate::blob::BlobError;
use crate::identity::VerificationStatus;
use crate::ingest::IngestError;
use crate::store::StoreError;

/// Errors that can occur during verification lifecycle operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerificationError {
    /// The operation is not valid for the identity's current status.
    #[error("operation {operation} not valid for identity {identity_id} in status {status}")]
    InvalidState {
        /// The identity whose status rejected the operation.
        identity_id: String,
        /// The status at the time of the attempt.
        status: VerificationStatus,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// Identity not found.
    #[error("identity not found: {identity_id}")]
    NotFound {
        /// The identity id that was not found.
        identity_id: String,
    },

    /// Lost a race on a transition; the caller must re-read and retry.
    #[error("concurrent modification of identity {identity_id}")]
    ConcurrentModification {
        /// The identity that was concurrently modified.
        identity_id: String,
    },

    /// Document ingestion rejected the payload.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// Blob storage failure.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// Audit log failure.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Storage backend fault not covered by a more specific variant.
    #[error("storage error: {0}")]
    Storage(String),
}

impl VerificationError {
    /// Maps a store error into workflow terms for a given identity.
    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => Self::NotFound { identity_id: id },
            StoreError::VersionConflict { id, .. } => {
                Self::ConcurrentModification { identity_id: id }
            },
            other => Self::Storage(other.to_string()),
        }
    }
}
