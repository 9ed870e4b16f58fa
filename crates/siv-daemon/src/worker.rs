//! Queue-driven automated review worker.
//!
//! Uploads enqueue a [`ReviewJob`] and return immediately; this worker
//! drains the queue and runs the automated pass for each job: move the
//! identity to `processing`, fetch the stored document, extract fields
//! under the OCR timeout, score them, and apply the match result.
//!
//! Failure posture: everything after `begin_automated_review` is
//! absorbed. A blob fault, OCR failure, or timeout leaves the identity in
//! `processing` — audited, logged, and waiting for a human — rather than
//! failing the upload retroactively.

use std::sync::Arc;

use siv_core::machine::{VerificationError, VerificationStateMachine};
use siv_core::matcher::{self, ClaimedFields};
use siv_core::{BlobStore, expiry};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ocr::{TextExtractor, extract_with_timeout};

/// Retries for a transition that lost a concurrent-modification race.
const MAX_TRANSITION_RETRIES: u32 = 3;

/// One unit of automated-review work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewJob {
    /// The identity to review.
    pub identity_id: String,
}

/// The automated review loop.
pub struct ReviewWorker {
    machine: Arc<VerificationStateMachine>,
    blobs: Arc<dyn BlobStore>,
    extractor: Arc<dyn TextExtractor>,
    ocr_timeout_ms: u64,
}

impl ReviewWorker {
    /// Creates a worker over shared collaborators.
    #[must_use]
    pub fn new(
        machine: Arc<VerificationStateMachine>,
        blobs: Arc<dyn BlobStore>,
        extractor: Arc<dyn TextExtractor>,
        ocr_timeout_ms: u64,
    ) -> Self {
        Self {
            machine,
            blobs,
            extractor,
            ocr_timeout_ms,
        }
    }

    /// Drains the job channel until all senders are dropped.
    pub async fn run(self, mut jobs: mpsc::Receiver<ReviewJob>) {
        info!("review worker started");
        while let Some(job) = jobs.recv().await {
            self.process(&job).await;
        }
        info!("review worker stopped");
    }

    /// Runs the automated pass for one job.
    pub async fn process(&self, job: &ReviewJob) {
        let identity_id = &job.identity_id;
        let now = crate::now_ms();

        let identity = match self.machine.begin_automated_review(identity_id, now) {
            Ok(identity) => identity,
            Err(VerificationError::InvalidState { status, .. }) => {
                // A staff decision or resubmission got there first.
                debug!(identity_id = %identity_id, status = %status, "skipping review job, identity moved on");
                return;
            },
            Err(err) => {
                warn!(identity_id = %identity_id, error = %err, "failed to begin automated review");
                return;
            },
        };

        let Some(document_key) = identity.document_key.as_deref() else {
            warn!(identity_id = %identity_id, "identity in processing without a document");
            return;
        };

        let document = match self.blobs.get(document_key) {
            Ok(document) => document,
            Err(err) => {
                warn!(identity_id = %identity_id, error = %err, "failed to load document for review");
                self.machine
                    .record_review_failure(identity_id, &err.to_string(), crate::now_ms());
                return;
            },
        };

        let extracted =
            match extract_with_timeout(self.extractor.as_ref(), &document, self.ocr_timeout_ms)
                .await
            {
                Ok(extracted) => extracted,
                Err(err) => {
                    // Absorbed: the identity stays in processing for a human.
                    warn!(identity_id = %identity_id, error = %err, "text extraction failed, holding for manual review");
                    self.machine
                        .record_review_failure(identity_id, &err.to_string(), crate::now_ms());
                    return;
                },
            };

        let claimed = ClaimedFields {
            full_name: &identity.claimed_full_name,
            institution: &identity.claimed_institution_id,
            external_id: identity.claimed_external_id.as_deref(),
        };
        let result = matcher::evaluate(&extracted, &claimed, self.machine.weights());
        let document_expires_at = extracted
            .expiry_date
            .as_deref()
            .and_then(expiry::document_expiry_ms);

        for attempt in 0..MAX_TRANSITION_RETRIES {
            match self.machine.apply_match_result(
                identity_id,
                &result,
                document_expires_at,
                crate::now_ms(),
            ) {
                Ok(identity) => {
                    info!(
                        identity_id = %identity_id,
                        confidence = result.confidence,
                        status = %identity.status,
                        "automated review applied"
                    );
                    return;
                },
                Err(VerificationError::ConcurrentModification { .. }) => {
                    debug!(identity_id = %identity_id, attempt, "lost transition race, retrying");
                },
                Err(err) => {
                    warn!(identity_id = %identity_id, error = %err, "failed to apply match result");
                    return;
                },
            }
        }
        warn!(identity_id = %identity_id, "gave up applying match result after repeated races");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use siv_core::audit::MemoryAuditLog;
    use siv_core::blob::MemoryBlobStore;
    use siv_core::identity::VerificationStatus;
    use siv_core::store::MemoryIdentityStore;
    use siv_core::{ExtractedFields, IdentityClaims};

    use super::*;
    use crate::ocr::OcrError;

    struct FixedExtractor(ExtractedFields);

    #[async_trait]
    impl TextExtractor for FixedExtractor {
        async fn extract(&self, _document: &[u8]) -> Result<ExtractedFields, OcrError> {
            Ok(self.0.clone())
        }
    }

    fn sample_jpeg() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(100, 60, image::Rgb([1, 2, 3]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    fn uploaded_identity(
        machine: &VerificationStateMachine,
    ) -> String {
        let identity = machine
            .register(
                IdentityClaims {
                    owner_id: "owner-1".to_string(),
                    claimed_full_name: "Jane Doe".to_string(),
                    claimed_institution_id: "Example State University".to_string(),
                    claimed_external_id: Some("S1234567".to_string()),
                },
                crate::now_ms(),
            )
            .unwrap();
        machine
            .submit_document(
                &identity.id,
                &sample_jpeg(),
                siv_core::DocumentKind::Jpeg,
                crate::now_ms(),
            )
            .unwrap();
        identity.id
    }

    fn worker_with(extractor: Arc<dyn TextExtractor>) -> (ReviewWorker, Arc<VerificationStateMachine>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let machine = Arc::new(VerificationStateMachine::new(
            Arc::new(MemoryIdentityStore::new()),
            Arc::clone(&blobs) as Arc<dyn BlobStore>,
            Arc::new(MemoryAuditLog::new()),
        ));
        let worker = ReviewWorker::new(
            Arc::clone(&machine),
            blobs,
            extractor,
            1_000,
        );
        (worker, machine)
    }

    #[tokio::test]
    async fn test_strong_match_auto_verifies() {
        let extractor = Arc::new(FixedExtractor(ExtractedFields {
            name: Some("JANE DOE".to_string()),
            external_id: Some("S1234567".to_string()),
            institution_name: Some("Example State University".to_string()),
            expiry_date: Some("2031-06-30".to_string()),
        }));
        let (worker, machine) = worker_with(extractor);
        let identity_id = uploaded_identity(&machine);

        worker
            .process(&ReviewJob {
                identity_id: identity_id.clone(),
            })
            .await;

        let identity = machine.get(&identity_id).unwrap();
        assert_eq!(identity.status, VerificationStatus::Verified);
        assert_eq!(identity.verified_by, None);
        assert!(identity.document_expires_at.is_some());
    }

    #[tokio::test]
    async fn test_weak_match_holds_for_manual_review() {
        let extractor = Arc::new(FixedExtractor(ExtractedFields {
            name: Some("Someone Else".to_string()),
            external_id: None,
            institution_name: Some("Example State University".to_string()),
            expiry_date: None,
        }));
        let (worker, machine) = worker_with(extractor);
        let identity_id = uploaded_identity(&machine);

        worker
            .process(&ReviewJob {
                identity_id: identity_id.clone(),
            })
            .await;

        let identity = machine.get(&identity_id).unwrap();
        assert_eq!(identity.status, VerificationStatus::Processing);
        assert_eq!(identity.confidence_score, Some(0.3));
    }

    #[tokio::test]
    async fn test_ocr_failure_is_absorbed() {
        let (worker, machine) = worker_with(Arc::new(crate::ocr::UnavailableExtractor));
        let identity_id = uploaded_identity(&machine);

        worker
            .process(&ReviewJob {
                identity_id: identity_id.clone(),
            })
            .await;

        let identity = machine.get(&identity_id).unwrap();
        assert_eq!(identity.status, VerificationStatus::Processing);
        assert_eq!(identity.confidence_score, None);
    }
}
