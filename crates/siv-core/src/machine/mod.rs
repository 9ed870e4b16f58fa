//! The authoritative verification lifecycle controller.
//!
//! [`VerificationStateMachine`] owns every status transition: it validates
//! preconditions against the allowed-transition table, decides auto-approval
//! versus manual-review routing, and writes exactly one audit entry per
//! attempt (failed attempts record [`AuditOutcome::Error`] so the forensic
//! trail stays complete).
//!
//! # State machine
//!
//! ```text
//! Pending --submit--> Uploaded --begin--> Processing --match >= 0.8--> Verified
//!                        ^                    |                           |
//!                        |              match < 0.8 (held              (time)
//!                        |               for a human)                     v
//!                        +-- resubmit -- Rejected/Expired <--------- Expired
//! ```
//!
//! # Concurrency
//!
//! Every mutation is an optimistic compare-and-swap on the identity's
//! `version` counter ([`IdentityStore::update`]). Two concurrent transition
//! attempts cannot both succeed; the loser observes
//! [`VerificationError::ConcurrentModification`] and must retry against
//! fresh state. The system never resolves the race itself — a silent
//! last-write-wins would corrupt the audit trail's causal order.

mod error;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

pub use error::VerificationError;

use crate::audit::{AuditAction, AuditEntry, AuditLog, AuditOutcome};
use crate::blob::BlobStore;
use crate::expiry;
use crate::identity::{Identity, IdentityClaims, VerificationStatus};
use crate::ingest::{self, DocumentKind};
use crate::matcher::{AUTO_APPROVE_THRESHOLD, MatchResult, MatchWeights};
use crate::store::IdentityStore;

/// The verification lifecycle controller.
///
/// Holds the storage collaborators behind trait objects; all operations are
/// synchronous and take explicit `now_ms` timestamps.
pub struct VerificationStateMachine {
    identities: Arc<dyn IdentityStore>,
    blobs: Arc<dyn BlobStore>,
    audit: Arc<dyn AuditLog>,
    weights: MatchWeights,
    auto_approve_threshold: f64,
}

impl VerificationStateMachine {
    /// Creates a machine with the default matcher parameters.
    #[must_use]
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        blobs: Arc<dyn BlobStore>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            identities,
            blobs,
            audit,
            weights: MatchWeights::default(),
            auto_approve_threshold: AUTO_APPROVE_THRESHOLD,
        }
    }

    /// Overrides the matcher weights and auto-approve threshold.
    ///
    /// The defaults are uncalibrated constants; deployments tuning them
    /// from labeled data configure the machine through this constructor.
    #[must_use]
    pub fn with_matcher(mut self, weights: MatchWeights, auto_approve_threshold: f64) -> Self {
        self.weights = weights;
        self.auto_approve_threshold = auto_approve_threshold;
        self
    }

    /// The matcher weights this machine scores with.
    #[must_use]
    pub const fn weights(&self) -> &MatchWeights {
        &self.weights
    }

    /// Registers a new identity in `Pending` with no document.
    ///
    /// This explicit factory is the only way identities come into
    /// existence; nothing is created implicitly on persistence.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::Storage`] on backend faults.
    pub fn register(
        &self,
        claims: IdentityClaims,
        now_ms: u64,
    ) -> Result<Identity, VerificationError> {
        let identity = Identity::register(Uuid::new_v4().to_string(), claims, now_ms);
        self.identities
            .insert(&identity)
            .map_err(VerificationError::from_store)?;
        Ok(identity)
    }

    /// Fetches an identity by id.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::NotFound`] for unknown ids.
    pub fn get(&self, identity_id: &str) -> Result<Identity, VerificationError> {
        self.identities
            .get(identity_id)
            .map_err(VerificationError::from_store)
    }

    /// Ingests and stores a document, moving the identity to `Uploaded`.
    ///
    /// Valid from `Pending`, `Rejected`, and `Expired`. A resubmission
    /// always discards stale review data: `confidence_score` and
    /// `status_reason` are cleared (prior values survive in the audit
    /// log).
    ///
    /// # Errors
    ///
    /// - [`VerificationError::InvalidState`] outside the accepted statuses
    /// - [`VerificationError::Ingest`] when validation/normalization fails
    /// - [`VerificationError::ConcurrentModification`] on a lost race
    pub fn submit_document(
        &self,
        identity_id: &str,
        raw: &[u8],
        kind: DocumentKind,
        now_ms: u64,
    ) -> Result<Identity, VerificationError> {
        let mut identity = self.get(identity_id)?;

        if !identity.status.accepts_upload() {
            return Err(self.fail(
                &identity,
                AuditAction::Upload,
                "upload",
                format!("status {} does not accept uploads", identity.status),
                None,
                now_ms,
            ));
        }

        let document = match ingest::ingest(raw, kind) {
            Ok(document) => document,
            Err(err) => {
                self.record_failure(identity_id, AuditAction::Upload, &err, None, now_ms);
                return Err(err.into());
            },
        };

        let key = match self.blobs.put(&document.normalized) {
            Ok(key) => key,
            Err(err) => {
                self.record_failure(identity_id, AuditAction::Upload, &err, None, now_ms);
                return Err(err.into());
            },
        };

        let expected = identity.version;
        identity.document_key = Some(key);
        identity.document_hash = Some(document.sha256_hex.clone());
        identity.status = VerificationStatus::Uploaded;
        identity.confidence_score = None;
        identity.status_reason = None;
        identity.updated_at = now_ms;

        let identity = self.commit(identity, expected, AuditAction::Upload, now_ms)?;

        let mut details = BTreeMap::new();
        details.insert("document_hash".to_string(), document.sha256_hex);
        details.insert("kind".to_string(), kind.as_str().to_string());
        details.insert(
            "normalized_bytes".to_string(),
            document.metadata.normalized_bytes.to_string(),
        );
        self.record(
            identity_id,
            AuditAction::Upload,
            AuditOutcome::Success,
            details,
            None,
            now_ms,
        )?;

        Ok(identity)
    }

    /// Moves an `Uploaded` identity to `Processing`.
    ///
    /// Idempotent: an identity already in `Processing` is returned
    /// unchanged, with no audit entry and no version bump.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::InvalidState`] outside
    /// `Uploaded`/`Processing`.
    pub fn begin_automated_review(
        &self,
        identity_id: &str,
        now_ms: u64,
    ) -> Result<Identity, VerificationError> {
        let mut identity = self.get(identity_id)?;

        if identity.status == VerificationStatus::Processing {
            return Ok(identity);
        }
        if identity.status != VerificationStatus::Uploaded {
            return Err(self.fail(
                &identity,
                AuditAction::BeginReview,
                "begin_automated_review",
                format!("cannot begin review from {}", identity.status),
                None,
                now_ms,
            ));
        }

        let expected = identity.version;
        identity.status = VerificationStatus::Processing;
        identity.updated_at = now_ms;
        let identity = self.commit(identity, expected, AuditAction::BeginReview, now_ms)?;

        self.record(
            identity_id,
            AuditAction::BeginReview,
            AuditOutcome::Success,
            BTreeMap::new(),
            None,
            now_ms,
        )?;

        Ok(identity)
    }

    /// Applies an automated match result to a `Processing` identity.
    ///
    /// The confidence is always recorded. At or above the auto-approve
    /// threshold the identity becomes `Verified` with `verified_by = None`
    /// (system-approved) and a 365-day verification window; below it the
    /// identity stays `Processing` with the confidence available to human
    /// reviewers.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::InvalidState`] unless `Processing`,
    /// [`VerificationError::ConcurrentModification`] on a lost race.
    pub fn apply_match_result(
        &self,
        identity_id: &str,
        result: &MatchResult,
        document_expires_at: Option<u64>,
        now_ms: u64,
    ) -> Result<Identity, VerificationError> {
        let mut identity = self.get(identity_id)?;

        if identity.status != VerificationStatus::Processing {
            return Err(self.fail(
                &identity,
                AuditAction::AutoVerify,
                "apply_match_result",
                format!("cannot apply match result in {}", identity.status),
                None,
                now_ms,
            ));
        }

        let approved = result.confidence >= self.auto_approve_threshold;

        let expected = identity.version;
        identity.confidence_score = Some(result.confidence);
        if let Some(deadline) = document_expires_at {
            identity.document_expires_at = Some(deadline);
        }
        if approved {
            identity.status = VerificationStatus::Verified;
            identity.verified_at = Some(now_ms);
            identity.verified_by = None;
            identity.verification_expires_at = Some(expiry::verification_expires_at(now_ms));
            identity.status_reason = None;
        }
        identity.updated_at = now_ms;
        let identity = self.commit(identity, expected, AuditAction::AutoVerify, now_ms)?;

        let mut details = BTreeMap::new();
        details.insert("confidence".to_string(), format!("{:.4}", result.confidence));
        details.insert("matched".to_string(), result.matched_fields.join(","));
        details.insert("mismatched".to_string(), result.mismatched_fields.join(","));
        self.record(
            identity_id,
            AuditAction::AutoVerify,
            if approved {
                AuditOutcome::Approved
            } else {
                AuditOutcome::Pending
            },
            details,
            None,
            now_ms,
        )?;

        Ok(identity)
    }

    /// Records an absorbed automated-review failure (OCR down, timeout).
    ///
    /// The identity is left untouched — still `Processing`, eligible for
    /// manual review or resubmission — but the attempt lands in the audit
    /// trail with `result = error`.
    pub fn record_review_failure(
        &self,
        identity_id: &str,
        detail: &str,
        now_ms: u64,
    ) {
        let mut details = BTreeMap::new();
        details.insert("error".to_string(), detail.to_string());
        // Best-effort: a failing audit backend must not mask the original
        // failure being recorded.
        let _ = self.audit.record(AuditEntry::new(
            identity_id,
            AuditAction::AutoVerify,
            AuditOutcome::Error,
            details,
            None,
            now_ms,
        ));
    }

    /// Staff approval. Valid from `Uploaded`, `Processing`, and
    /// `Appealing` (the re-entrant edge used by appeal resolution).
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::InvalidState`] outside those statuses,
    /// [`VerificationError::ConcurrentModification`] on a lost race.
    pub fn manual_approve(
        &self,
        identity_id: &str,
        staff_user: &str,
        notes: Option<&str>,
        now_ms: u64,
    ) -> Result<Identity, VerificationError> {
        let mut identity = self.get(identity_id)?;

        if !identity.status.accepts_staff_decision() {
            return Err(self.fail(
                &identity,
                AuditAction::ManualApprove,
                "manual_approve",
                format!("cannot approve from {}", identity.status),
                Some(staff_user.to_string()),
                now_ms,
            ));
        }

        let expected = identity.version;
        identity.status = VerificationStatus::Verified;
        identity.verified_at = Some(now_ms);
        identity.verified_by = Some(staff_user.to_string());
        identity.verification_expires_at = Some(expiry::verification_expires_at(now_ms));
        identity.status_reason = notes.map(str::to_string);
        identity.updated_at = now_ms;
        let identity = self.commit(identity, expected, AuditAction::ManualApprove, now_ms)?;

        let mut details = BTreeMap::new();
        if let Some(notes) = notes {
            details.insert("notes".to_string(), notes.to_string());
        }
        self.record(
            identity_id,
            AuditAction::ManualApprove,
            AuditOutcome::Approved,
            details,
            Some(staff_user.to_string()),
            now_ms,
        )?;

        Ok(identity)
    }

    /// Staff rejection. Valid from `Uploaded`, `Processing`, and
    /// `Appealing`.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::InvalidState`] outside those statuses,
    /// [`VerificationError::ConcurrentModification`] on a lost race.
    pub fn manual_reject(
        &self,
        identity_id: &str,
        staff_user: &str,
        reason: &str,
        now_ms: u64,
    ) -> Result<Identity, VerificationError> {
        let mut identity = self.get(identity_id)?;

        if !identity.status.accepts_staff_decision() {
            return Err(self.fail(
                &identity,
                AuditAction::ManualReject,
                "manual_reject",
                format!("cannot reject from {}", identity.status),
                Some(staff_user.to_string()),
                now_ms,
            ));
        }

        let expected = identity.version;
        identity.status = VerificationStatus::Rejected;
        identity.status_reason = Some(reason.to_string());
        identity.updated_at = now_ms;
        let identity = self.commit(identity, expected, AuditAction::ManualReject, now_ms)?;

        let mut details = BTreeMap::new();
        details.insert("reason".to_string(), reason.to_string());
        self.record(
            identity_id,
            AuditAction::ManualReject,
            AuditOutcome::Denied,
            details,
            Some(staff_user.to_string()),
            now_ms,
        )?;

        Ok(identity)
    }

    /// Lazy expiration check, run before trusting `is_verified`.
    ///
    /// A `Verified` identity whose verification window has passed flips to
    /// `Expired` (persisted, one audit entry). Idempotent: calling it on
    /// an already-`Expired` identity — or any other status — changes
    /// nothing and records nothing.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::NotFound`] for unknown ids,
    /// [`VerificationError::ConcurrentModification`] on a lost race.
    pub fn check_expiration(
        &self,
        identity_id: &str,
        now_ms: u64,
    ) -> Result<Identity, VerificationError> {
        let mut identity = self.get(identity_id)?;

        if identity.status != VerificationStatus::Verified
            || !expiry::is_expired(identity.verification_expires_at, now_ms)
        {
            return Ok(identity);
        }

        let expected = identity.version;
        identity.status = VerificationStatus::Expired;
        identity.status_reason = Some("verification expired".to_string());
        identity.updated_at = now_ms;
        let identity = self.commit(identity, expected, AuditAction::Expire, now_ms)?;

        let mut details = BTreeMap::new();
        if let Some(deadline) = identity.verification_expires_at {
            details.insert("expired_at".to_string(), deadline.to_string());
        }
        self.record(
            identity_id,
            AuditAction::Expire,
            AuditOutcome::Success,
            details,
            None,
            now_ms,
        )?;

        Ok(identity)
    }

    /// Marks a `Rejected`/`Expired` identity `Appealing`.
    ///
    /// Invoked only by the appeal workflow, which writes the audit entry
    /// for the appeal action as a whole.
    pub(crate) fn begin_appeal(
        &self,
        identity_id: &str,
        now_ms: u64,
    ) -> Result<Identity, VerificationError> {
        let mut identity = self.get(identity_id)?;

        if !identity.status.accepts_appeal() {
            return Err(VerificationError::InvalidState {
                identity_id: identity.id,
                status: identity.status,
                operation: "open_appeal",
            });
        }

        let expected = identity.version;
        identity.status = VerificationStatus::Appealing;
        identity.updated_at = now_ms;
        self.identities
            .update(&identity, expected)
            .map_err(VerificationError::from_store)
    }

    /// Reverts an `Appealing` identity to a terminal status (`Rejected`
    /// after a denial, or its pre-appeal status after a withdrawal).
    ///
    /// Invoked only by the appeal workflow.
    pub(crate) fn revert_appeal(
        &self,
        identity_id: &str,
        to: VerificationStatus,
        reason: Option<&str>,
        now_ms: u64,
    ) -> Result<Identity, VerificationError> {
        let mut identity = self.get(identity_id)?;

        if identity.status != VerificationStatus::Appealing || !identity.status.can_transition_to(to)
        {
            return Err(VerificationError::InvalidState {
                identity_id: identity.id,
                status: identity.status,
                operation: "revert_appeal",
            });
        }

        let expected = identity.version;
        identity.status = to;
        if let Some(reason) = reason {
            identity.status_reason = Some(reason.to_string());
        }
        identity.updated_at = now_ms;
        self.identities
            .update(&identity, expected)
            .map_err(VerificationError::from_store)
    }

    /// Commits a mutated identity via compare-and-swap, auditing the
    /// failure when the race is lost.
    fn commit(
        &self,
        identity: Identity,
        expected_version: u64,
        action: AuditAction,
        now_ms: u64,
    ) -> Result<Identity, VerificationError> {
        match self.identities.update(&identity, expected_version) {
            Ok(updated) => Ok(updated),
            Err(err) => {
                let mapped = VerificationError::from_store(err);
                self.record_failure(&identity.id, action, &mapped, None, now_ms);
                Err(mapped)
            },
        }
    }

    /// Records an `InvalidState` failure and returns the error.
    fn fail(
        &self,
        identity: &Identity,
        action: AuditAction,
        operation: &'static str,
        detail: String,
        performed_by: Option<String>,
        now_ms: u64,
    ) -> VerificationError {
        let err = VerificationError::InvalidState {
            identity_id: identity.id.clone(),
            status: identity.status,
            operation,
        };
        let mut details = BTreeMap::new();
        details.insert("error".to_string(), detail);
        details.insert("operation".to_string(), operation.to_string());
        let _ = self.audit.record(AuditEntry::new(
            &identity.id,
            action,
            AuditOutcome::Error,
            details,
            performed_by,
            now_ms,
        ));
        err
    }

    /// Records a failed attempt, best-effort.
    fn record_failure(
        &self,
        identity_id: &str,
        action: AuditAction,
        err: &dyn std::fmt::Display,
        performed_by: Option<String>,
        now_ms: u64,
    ) {
        let mut details = BTreeMap::new();
        details.insert("error".to_string(), err.to_string());
        let _ = self.audit.record(AuditEntry::new(
            identity_id,
            action,
            AuditOutcome::Error,
            details,
            performed_by,
            now_ms,
        ));
    }

    /// Records a successful attempt, propagating audit backend failures.
    fn record(
        &self,
        identity_id: &str,
        action: AuditAction,
        result: AuditOutcome,
        details: BTreeMap<String, String>,
        performed_by: Option<String>,
        now_ms: u64,
    ) -> Result<(), VerificationError> {
        self.audit.record(AuditEntry::new(
            identity_id,
            action,
            result,
            details,
            performed_by,
            now_ms,
        ))?;
        Ok(())
    }
}
