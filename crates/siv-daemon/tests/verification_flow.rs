//! End-to-end verification scenarios over the SQLite stores.

use std::sync::Arc;

use async_trait::async_trait;
use siv_core::appeal::{AppealDecision, AppealWorkflow};
use siv_core::audit::{AuditAction, AuditLog};
use siv_core::expiry::VERIFICATION_TTL_MS;
use siv_core::identity::{IdentityClaims, VerificationStatus};
use siv_core::ingest::{DocumentKind, IngestError, MAX_DOCUMENT_SIZE};
use siv_core::machine::{VerificationError, VerificationStateMachine};
use siv_core::{BlobStore, ExtractedFields};
use siv_daemon::ocr::{OcrError, TextExtractor};
use siv_daemon::storage::Database;
use siv_daemon::worker::{ReviewJob, ReviewWorker};

const NOW: u64 = 1_700_000_000_000;

struct FixedExtractor(ExtractedFields);

#[async_trait]
impl TextExtractor for FixedExtractor {
    async fn extract(&self, _document: &[u8]) -> Result<ExtractedFields, OcrError> {
        Ok(self.0.clone())
    }
}

struct Fixture {
    machine: Arc<VerificationStateMachine>,
    appeals: AppealWorkflow,
    blobs: Arc<dyn BlobStore>,
    database: Database,
}

fn fixture() -> Fixture {
    let database = Database::in_memory().unwrap();
    let blobs: Arc<dyn BlobStore> = Arc::new(database.blobs());
    let audit = Arc::new(database.audit());
    let machine = Arc::new(VerificationStateMachine::new(
        Arc::new(database.identities()),
        Arc::clone(&blobs),
        audit.clone(),
    ));
    let appeals = AppealWorkflow::new(
        Arc::clone(&machine),
        Arc::new(database.appeals()),
        Arc::clone(&blobs),
        audit,
    );
    Fixture {
        machine,
        appeals,
        blobs,
        database,
    }
}

fn claims() -> IdentityClaims {
    IdentityClaims {
        owner_id: "owner-1".to_string(),
        claimed_full_name: "Jane Doe".to_string(),
        claimed_institution_id: "Example State University".to_string(),
        claimed_external_id: Some("S1234567".to_string()),
    }
}

fn sample_jpeg() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(800, 500, image::Rgb([90, 120, 160]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

/// Scenario A: clean JPEG, strong extraction, auto-approval.
#[tokio::test]
async fn scenario_a_clean_upload_auto_verifies() {
    let fx = fixture();
    let identity = fx.machine.register(claims(), NOW).unwrap();

    let uploaded = fx
        .machine
        .submit_document(&identity.id, &sample_jpeg(), DocumentKind::Jpeg, NOW)
        .unwrap();
    assert_eq!(uploaded.status, VerificationStatus::Uploaded);

    let worker = ReviewWorker::new(
        Arc::clone(&fx.machine),
        Arc::clone(&fx.blobs),
        Arc::new(FixedExtractor(ExtractedFields {
            name: Some("JANE DOE".to_string()),
            external_id: Some("S1234567".to_string()),
            institution_name: Some("Example State University".to_string()),
            expiry_date: None,
        })),
        1_000,
    );
    worker
        .process(&ReviewJob {
            identity_id: identity.id.clone(),
        })
        .await;

    let verified = fx.machine.get(&identity.id).unwrap();
    assert_eq!(verified.status, VerificationStatus::Verified);
    assert_eq!(verified.verified_by, None);
    assert_eq!(verified.confidence_score, Some(1.0));
    let verified_at = verified.verified_at.unwrap();
    assert_eq!(
        verified.verification_expires_at,
        Some(verified_at + VERIFICATION_TTL_MS)
    );
}

/// Scenario B: oversized payload is rejected and the identity stays put.
#[test]
fn scenario_b_oversized_upload_stays_pending() {
    let fx = fixture();
    let identity = fx.machine.register(claims(), NOW).unwrap();

    let oversized = vec![0u8; MAX_DOCUMENT_SIZE + 1];
    let result = fx
        .machine
        .submit_document(&identity.id, &oversized, DocumentKind::Jpeg, NOW);
    assert!(matches!(
        result,
        Err(VerificationError::Ingest(
            IngestError::PayloadTooLarge { .. }
        ))
    ));

    let identity = fx.machine.get(&identity.id).unwrap();
    assert_eq!(identity.status, VerificationStatus::Pending);
}

/// Scenario C: lapsed verification expires lazily, exactly once.
#[test]
fn scenario_c_lazy_expiration() {
    let fx = fixture();
    let identity = fx.machine.register(claims(), NOW).unwrap();
    fx.machine
        .submit_document(&identity.id, &sample_jpeg(), DocumentKind::Jpeg, NOW)
        .unwrap();
    fx.machine.begin_automated_review(&identity.id, NOW).unwrap();
    fx.machine
        .manual_approve(&identity.id, "staff-1", None, NOW)
        .unwrap();

    let later = NOW + VERIFICATION_TTL_MS + 60_000;
    let expired = fx.machine.check_expiration(&identity.id, later).unwrap();
    assert_eq!(expired.status, VerificationStatus::Expired);

    // Second check: no state change, no extra audit entry.
    fx.machine.check_expiration(&identity.id, later + 1).unwrap();
    let audit = fx.database.audit();
    let expire_entries = audit
        .query(&identity.id)
        .unwrap()
        .into_iter()
        .filter(|entry| entry.action == AuditAction::Expire)
        .count();
    assert_eq!(expire_entries, 1);
}

/// Scenario D: rejected, appealed, approved by staff.
#[test]
fn scenario_d_appeal_approval_forces_verified() {
    let fx = fixture();
    let identity = fx.machine.register(claims(), NOW).unwrap();
    fx.machine
        .submit_document(&identity.id, &sample_jpeg(), DocumentKind::Jpeg, NOW)
        .unwrap();
    fx.machine.begin_automated_review(&identity.id, NOW).unwrap();
    fx.machine
        .manual_reject(&identity.id, "staff-1", "name unreadable", NOW)
        .unwrap();

    let appeal = fx
        .appeals
        .open(&identity.id, "the scan was blurry, new copy attached", None, NOW + 10)
        .unwrap();
    let resolved = fx
        .appeals
        .resolve(
            &appeal.id,
            "staff-2",
            AppealDecision::Approved,
            Some("new copy is legible"),
            NOW + 20,
        )
        .unwrap();

    assert_eq!(resolved.status, siv_core::AppealStatus::Approved);
    let identity = fx.machine.get(&identity.id).unwrap();
    assert_eq!(identity.status, VerificationStatus::Verified);
    assert_eq!(identity.verified_by.as_deref(), Some("staff-2"));
}

/// The audit trail for a full journey is complete and newest-first.
#[tokio::test]
async fn audit_trail_records_every_step() {
    // The worker stamps wall-clock time, so the whole journey runs on it.
    let fx = fixture();
    let t0 = siv_daemon::now_ms();
    let identity = fx.machine.register(claims(), t0).unwrap();
    fx.machine
        .submit_document(&identity.id, &sample_jpeg(), DocumentKind::Jpeg, t0)
        .unwrap();

    let worker = ReviewWorker::new(
        Arc::clone(&fx.machine),
        Arc::clone(&fx.blobs),
        Arc::new(FixedExtractor(ExtractedFields {
            name: Some("Someone Else Entirely".to_string()),
            external_id: None,
            institution_name: None,
            expiry_date: None,
        })),
        1_000,
    );
    worker
        .process(&ReviewJob {
            identity_id: identity.id.clone(),
        })
        .await;
    fx.machine
        .manual_reject(
            &identity.id,
            "staff-1",
            "no matching fields",
            siv_daemon::now_ms() + 1,
        )
        .unwrap();

    let audit = fx.database.audit();
    let entries = audit.query(&identity.id).unwrap();
    let actions: Vec<AuditAction> = entries.iter().map(|entry| entry.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::ManualReject,
            AuditAction::AutoVerify,
            AuditAction::BeginReview,
            AuditAction::Upload,
        ]
    );
    // Newest first.
    for pair in entries.windows(2) {
        assert!(pair[0].occurred_at >= pair[1].occurred_at);
    }
}

/// Document resubmission after expiry restarts the flow cleanly.
#[test]
fn resubmission_after_expiry_clears_stale_data() {
    let fx = fixture();
    let identity = fx.machine.register(claims(), NOW).unwrap();
    fx.machine
        .submit_document(&identity.id, &sample_jpeg(), DocumentKind::Jpeg, NOW)
        .unwrap();
    fx.machine.begin_automated_review(&identity.id, NOW).unwrap();
    fx.machine
        .apply_match_result(
            &identity.id,
            &siv_core::MatchResult {
                confidence: 0.85,
                matched_fields: vec!["name".to_string()],
                mismatched_fields: vec![],
            },
            None,
            NOW,
        )
        .unwrap();

    let later = NOW + VERIFICATION_TTL_MS + 1;
    fx.machine.check_expiration(&identity.id, later).unwrap();

    let resubmitted = fx
        .machine
        .submit_document(&identity.id, &sample_jpeg(), DocumentKind::Jpeg, later + 10)
        .unwrap();
    assert_eq!(resubmitted.status, VerificationStatus::Uploaded);
    assert_eq!(resubmitted.confidence_score, None);
    assert_eq!(resubmitted.status_reason, None);
}
