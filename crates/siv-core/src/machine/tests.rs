//! Tests for the verification state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::*;
use crate::audit::MemoryAuditLog;
use crate::blob::MemoryBlobStore;
use crate::matcher::MatchResult;
use crate::store::{MemoryIdentityStore, StoreError};

const NOW: u64 = 1_700_000_000_000;

fn claims() -> IdentityClaims {
    IdentityClaims {
        owner_id: "owner-1".to_string(),
        claimed_full_name: "Jane Doe".to_string(),
        claimed_institution_id: "Example State University".to_string(),
        claimed_external_id: Some("S1234567".to_string()),
    }
}

fn machine() -> (VerificationStateMachine, MemoryAuditLog, MemoryIdentityStore) {
    let identities = MemoryIdentityStore::new();
    let audit = MemoryAuditLog::new();
    let machine = VerificationStateMachine::new(
        Arc::new(identities.clone()),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(audit.clone()),
    );
    (machine, audit, identities)
}

fn match_result(confidence: f64) -> MatchResult {
    MatchResult {
        confidence,
        matched_fields: vec!["name".to_string()],
        mismatched_fields: vec![],
    }
}

fn sample_jpeg() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(320, 200, image::Rgb([10, 20, 30]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

/// Drives a fresh identity to `Processing`.
fn processing_identity(machine: &VerificationStateMachine) -> Identity {
    let identity = machine.register(claims(), NOW).unwrap();
    machine
        .submit_document(&identity.id, &sample_jpeg(), DocumentKind::Jpeg, NOW)
        .unwrap();
    machine.begin_automated_review(&identity.id, NOW).unwrap()
}

// =============================================================================
// Submission
// =============================================================================

#[test]
fn test_submit_from_pending_uploads() {
    let (machine, audit, _) = machine();
    let identity = machine.register(claims(), NOW).unwrap();

    let identity = machine
        .submit_document(&identity.id, &sample_jpeg(), DocumentKind::Jpeg, NOW)
        .unwrap();

    assert_eq!(identity.status, VerificationStatus::Uploaded);
    assert!(identity.document_key.is_some());
    assert!(identity.document_hash.is_some());

    let entries = audit.query(&identity.id).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::Upload);
    assert_eq!(entries[0].result, AuditOutcome::Success);
}

#[test]
fn test_submit_from_uploaded_is_invalid() {
    let (machine, audit, _) = machine();
    let identity = machine.register(claims(), NOW).unwrap();
    machine
        .submit_document(&identity.id, &sample_jpeg(), DocumentKind::Jpeg, NOW)
        .unwrap();

    let result = machine.submit_document(&identity.id, &sample_jpeg(), DocumentKind::Jpeg, NOW);
    assert!(matches!(result, Err(VerificationError::InvalidState { .. })));

    // The failed attempt is still audited.
    let entries = audit.query(&identity.id).unwrap();
    assert_eq!(entries[0].result, AuditOutcome::Error);
}

#[test]
fn test_oversized_submit_leaves_identity_pending() {
    let (machine, audit, _) = machine();
    let identity = machine.register(claims(), NOW).unwrap();

    let raw = vec![0u8; crate::ingest::MAX_DOCUMENT_SIZE + 1];
    let result = machine.submit_document(&identity.id, &raw, DocumentKind::Jpeg, NOW);
    assert!(matches!(
        result,
        Err(VerificationError::Ingest(
            crate::ingest::IngestError::PayloadTooLarge { .. }
        ))
    ));

    let identity = machine.get(&identity.id).unwrap();
    assert_eq!(identity.status, VerificationStatus::Pending);
    assert_eq!(
        audit.query(&identity.id).unwrap()[0].result,
        AuditOutcome::Error
    );
}

#[test]
fn test_resubmission_clears_stale_review_data() {
    let (machine, _, _) = machine();
    let identity = processing_identity(&machine);
    machine
        .apply_match_result(&identity.id, &match_result(0.4), None, NOW)
        .unwrap();
    machine
        .manual_reject(&identity.id, "staff-1", "photo unreadable", NOW)
        .unwrap();

    let rejected = machine.get(&identity.id).unwrap();
    assert_eq!(rejected.confidence_score, Some(0.4));
    assert_eq!(rejected.status_reason.as_deref(), Some("photo unreadable"));

    let resubmitted = machine
        .submit_document(&identity.id, &sample_jpeg(), DocumentKind::Jpeg, NOW + 10)
        .unwrap();
    assert_eq!(resubmitted.status, VerificationStatus::Uploaded);
    assert_eq!(resubmitted.confidence_score, None);
    assert_eq!(resubmitted.status_reason, None);
}

// =============================================================================
// Automated review
// =============================================================================

#[test]
fn test_begin_review_is_idempotent() {
    let (machine, audit, _) = machine();
    let identity = processing_identity(&machine);

    let before = audit.query(&identity.id).unwrap().len();
    let again = machine.begin_automated_review(&identity.id, NOW + 5).unwrap();

    assert_eq!(again.status, VerificationStatus::Processing);
    assert_eq!(again.version, identity.version);
    assert_eq!(audit.query(&identity.id).unwrap().len(), before);
}

#[test]
fn test_begin_review_requires_uploaded() {
    let (machine, _, _) = machine();
    let identity = machine.register(claims(), NOW).unwrap();

    let result = machine.begin_automated_review(&identity.id, NOW);
    assert!(matches!(result, Err(VerificationError::InvalidState { .. })));
}

#[test]
fn test_threshold_boundary_exactly_point_eight_approves() {
    let (machine, _, _) = machine();
    let identity = processing_identity(&machine);

    let verified = machine
        .apply_match_result(&identity.id, &match_result(0.8), None, NOW)
        .unwrap();

    assert_eq!(verified.status, VerificationStatus::Verified);
    assert_eq!(verified.verified_by, None);
    assert_eq!(verified.verified_at, Some(NOW));
    assert_eq!(
        verified.verification_expires_at,
        Some(NOW + crate::expiry::VERIFICATION_TTL_MS)
    );
}

#[test]
fn test_threshold_boundary_just_below_holds_for_review() {
    let (machine, audit, _) = machine();
    let identity = processing_identity(&machine);

    let held = machine
        .apply_match_result(&identity.id, &match_result(0.7999), None, NOW)
        .unwrap();

    assert_eq!(held.status, VerificationStatus::Processing);
    assert_eq!(held.confidence_score, Some(0.7999));
    assert!(held.verified_at.is_none());

    let entries = audit.query(&identity.id).unwrap();
    assert_eq!(entries[0].action, AuditAction::AutoVerify);
    assert_eq!(entries[0].result, AuditOutcome::Pending);
}

#[test]
fn test_match_result_records_document_expiry() {
    let (machine, _, _) = machine();
    let identity = processing_identity(&machine);

    let updated = machine
        .apply_match_result(&identity.id, &match_result(0.9), Some(NOW + 1_000), NOW)
        .unwrap();
    assert_eq!(updated.document_expires_at, Some(NOW + 1_000));
}

#[test]
fn test_review_failure_is_absorbed() {
    let (machine, audit, _) = machine();
    let identity = processing_identity(&machine);

    machine.record_review_failure(&identity.id, "ocr timeout after 30s", NOW);

    let unchanged = machine.get(&identity.id).unwrap();
    assert_eq!(unchanged.status, VerificationStatus::Processing);
    assert_eq!(unchanged.confidence_score, None);

    let entries = audit.query(&identity.id).unwrap();
    assert_eq!(entries[0].result, AuditOutcome::Error);
    assert_eq!(
        entries[0].details.get("error").map(String::as_str),
        Some("ocr timeout after 30s")
    );
}

// =============================================================================
// Staff decisions
// =============================================================================

#[test]
fn test_manual_approve_stamps_staff_user() {
    let (machine, _, _) = machine();
    let identity = processing_identity(&machine);

    let verified = machine
        .manual_approve(&identity.id, "staff-1", Some("checked by hand"), NOW)
        .unwrap();

    assert_eq!(verified.status, VerificationStatus::Verified);
    assert_eq!(verified.verified_by.as_deref(), Some("staff-1"));
}

#[test]
fn test_manual_reject_records_reason() {
    let (machine, audit, _) = machine();
    let identity = processing_identity(&machine);

    let rejected = machine
        .manual_reject(&identity.id, "staff-1", "name mismatch", NOW)
        .unwrap();

    assert_eq!(rejected.status, VerificationStatus::Rejected);
    assert_eq!(rejected.status_reason.as_deref(), Some("name mismatch"));

    let entries = audit.query(&identity.id).unwrap();
    assert_eq!(entries[0].result, AuditOutcome::Denied);
    assert_eq!(entries[0].performed_by.as_deref(), Some("staff-1"));
}

#[test]
fn test_staff_decision_invalid_from_verified() {
    let (machine, _, _) = machine();
    let identity = processing_identity(&machine);
    machine
        .apply_match_result(&identity.id, &match_result(0.95), None, NOW)
        .unwrap();

    let result = machine.manual_reject(&identity.id, "staff-1", "too late", NOW);
    assert!(matches!(result, Err(VerificationError::InvalidState { .. })));
}

// =============================================================================
// Expiration
// =============================================================================

#[test]
fn test_expired_verification_flips_lazily() {
    let (machine, audit, _) = machine();
    let identity = processing_identity(&machine);
    machine
        .apply_match_result(&identity.id, &match_result(0.9), None, NOW)
        .unwrap();

    let later = NOW + crate::expiry::VERIFICATION_TTL_MS + 1;
    let expired = machine.check_expiration(&identity.id, later).unwrap();
    assert_eq!(expired.status, VerificationStatus::Expired);

    let expire_entries: Vec<_> = audit
        .query(&identity.id)
        .unwrap()
        .into_iter()
        .filter(|entry| entry.action == AuditAction::Expire)
        .collect();
    assert_eq!(expire_entries.len(), 1);
}

#[test]
fn test_check_expiration_is_idempotent() {
    let (machine, audit, _) = machine();
    let identity = processing_identity(&machine);
    machine
        .apply_match_result(&identity.id, &match_result(0.9), None, NOW)
        .unwrap();

    let later = NOW + crate::expiry::VERIFICATION_TTL_MS + 1;
    machine.check_expiration(&identity.id, later).unwrap();
    let entries_after_first = audit.query(&identity.id).unwrap().len();
    let version_after_first = machine.get(&identity.id).unwrap().version;

    let second = machine.check_expiration(&identity.id, later + 1).unwrap();
    assert_eq!(second.status, VerificationStatus::Expired);
    assert_eq!(second.version, version_after_first);
    assert_eq!(audit.query(&identity.id).unwrap().len(), entries_after_first);
}

#[test]
fn test_unexpired_verification_is_untouched() {
    let (machine, _, _) = machine();
    let identity = processing_identity(&machine);
    machine
        .apply_match_result(&identity.id, &match_result(0.9), None, NOW)
        .unwrap();

    let still = machine
        .check_expiration(&identity.id, NOW + 1_000)
        .unwrap();
    assert_eq!(still.status, VerificationStatus::Verified);
}

// =============================================================================
// Concurrency
// =============================================================================

/// Identity store that, once armed, lets a competing writer slip in
/// between the machine's read and its compare-and-swap, deterministically.
#[derive(Clone)]
struct RacingStore {
    inner: MemoryIdentityStore,
    armed: Arc<AtomicBool>,
}

impl RacingStore {
    fn new(inner: MemoryIdentityStore) -> Self {
        Self {
            inner,
            armed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl crate::store::IdentityStore for RacingStore {
    fn insert(&self, identity: &Identity) -> Result<(), StoreError> {
        self.inner.insert(identity)
    }

    fn get(&self, id: &str) -> Result<Identity, StoreError> {
        self.inner.get(id)
    }

    fn update(&self, identity: &Identity, expected_version: u64) -> Result<Identity, StoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            // Competing approval wins the write first.
            let mut winner = self.inner.get(&identity.id)?;
            let winner_version = winner.version;
            winner.status = VerificationStatus::Verified;
            winner.verified_by = Some("staff-2".to_string());
            self.inner.update(&winner, winner_version)?;
        }
        self.inner.update(identity, expected_version)
    }
}

#[test]
fn test_lost_race_surfaces_concurrent_modification() {
    let identities = MemoryIdentityStore::new();
    let audit = MemoryAuditLog::new();
    let racing = RacingStore::new(identities.clone());
    let armed = Arc::clone(&racing.armed);
    let machine = VerificationStateMachine::new(
        Arc::new(racing),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(audit.clone()),
    );

    let identity = processing_identity(&machine);
    armed.store(true, Ordering::SeqCst);
    let result = machine.manual_reject(&identity.id, "staff-1", "blurry", NOW);

    assert!(matches!(
        result,
        Err(VerificationError::ConcurrentModification { .. })
    ));
    // The winner's write stands; the loser changed nothing.
    let stored = identities.get(&identity.id).unwrap();
    assert_eq!(stored.status, VerificationStatus::Verified);
    assert_eq!(stored.verified_by.as_deref(), Some("staff-2"));
    // The losing attempt is audited as an error.
    assert_eq!(
        audit.query(&identity.id).unwrap()[0].result,
        AuditOutcome::Error
    );
}

#[test]
fn test_simultaneous_staff_decisions_exactly_one_wins() {
    let (machine, audit, _) = machine();
    let machine = Arc::new(machine);
    let identity = processing_identity(&machine);

    let approve = {
        let machine = Arc::clone(&machine);
        let id = identity.id.clone();
        std::thread::spawn(move || machine.manual_approve(&id, "staff-1", None, NOW))
    };
    let reject = {
        let machine = Arc::clone(&machine);
        let id = identity.id.clone();
        std::thread::spawn(move || machine.manual_reject(&id, "staff-2", "mismatch", NOW))
    };

    let outcomes = [approve.join().unwrap(), reject.join().unwrap()];
    let successes = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    for outcome in &outcomes {
        if let Err(err) = outcome {
            assert!(matches!(
                err,
                VerificationError::ConcurrentModification { .. }
                    | VerificationError::InvalidState { .. }
            ));
        }
    }

    // Exactly one audit entry records an accepted staff decision.
    let accepted: Vec<_> = audit
        .query(&identity.id)
        .unwrap()
        .into_iter()
        .filter(|entry| {
            matches!(
                entry.action,
                AuditAction::ManualApprove | AuditAction::ManualReject
            ) && matches!(entry.result, AuditOutcome::Approved | AuditOutcome::Denied)
        })
        .collect();
    assert_eq!(accepted.len(), 1);
}
