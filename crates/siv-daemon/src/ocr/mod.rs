//! Text-extraction collaborator contract.
//!
//! The OCR engine itself is out of scope; this module fixes its output
//! contract ([`siv_core::ExtractedFields`]) and the failure posture: every
//! call runs under a timeout, and any failure — engine error, timeout,
//! transport — is an [`OcrError`] the review worker absorbs. An OCR
//! failure routes the identity into manual review; it never fails the
//! upload and never corrupts identity state.

use std::time::Duration;

use async_trait::async_trait;
use siv_core::ExtractedFields;
use thiserror::Error;

/// Errors from the external text-extraction service.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OcrError {
    /// The engine did not answer within the configured timeout.
    #[error("text extraction timed out after {timeout_ms} ms")]
    Timeout {
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The engine is unreachable or returned a failure.
    #[error("text extraction service failure: {0}")]
    ServiceFailure(String),
}

/// External OCR collaborator.
///
/// Implementations are always treated as fallible and latency-bound;
/// callers must go through [`extract_with_timeout`].
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extracts identity fields from a stored (normalized) document.
    ///
    /// # Errors
    ///
    /// Returns [`OcrError::ServiceFailure`] when the engine cannot
    /// process the document.
    async fn extract(&self, document: &[u8]) -> Result<ExtractedFields, OcrError>;
}

/// Runs an extraction under the configured timeout.
///
/// # Errors
///
/// Returns [`OcrError::Timeout`] when the deadline elapses; the in-flight
/// attempt is dropped and no partial state leaks.
pub async fn extract_with_timeout(
    extractor: &dyn TextExtractor,
    document: &[u8],
    timeout_ms: u64,
) -> Result<ExtractedFields, OcrError> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), extractor.extract(document))
        .await
        .map_err(|_| OcrError::Timeout { timeout_ms })?
}

/// Extractor for deployments without an OCR engine: every call fails,
/// so every upload lands in manual review.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableExtractor;

#[async_trait]
impl TextExtractor for UnavailableExtractor {
    async fn extract(&self, _document: &[u8]) -> Result<ExtractedFields, OcrError> {
        Err(OcrError::ServiceFailure(
            "no text extraction engine configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowExtractor;

    #[async_trait]
    impl TextExtractor for SlowExtractor {
        async fn extract(&self, _document: &[u8]) -> Result<ExtractedFields, OcrError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ExtractedFields::default())
        }
    }

    #[tokio::test]
    async fn test_timeout_elapses() {
        tokio::time::pause();
        let fut = extract_with_timeout(&SlowExtractor, b"doc", 1_000);
        let result = fut.await;
        assert!(matches!(result, Err(OcrError::Timeout { timeout_ms: 1_000 })));
    }

    #[tokio::test]
    async fn test_unavailable_extractor_always_fails() {
        let result = extract_with_timeout(&UnavailableExtractor, b"doc", 1_000).await;
        assert!(matches!(result, Err(OcrError::ServiceFailure(_))));
    }
}
