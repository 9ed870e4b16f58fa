//! One-shot appeal workflow for rejected/expired identities.
//!
//! An [`Appeal`] is a bounded re-review cycle: the owner of a `rejected`
//! or `expired` identity opens it (optionally attaching supplementary
//! evidence), staff resolve it, and resolution forces the identity's
//! status — `verified` on approval, back to `rejected` on denial. The
//! owner may withdraw a still-`pending` appeal, which restores the
//! identity to whatever terminal state it held before the appeal.
//!
//! # State machine
//!
//! ```text
//! (identity rejected|expired) --open--> Pending --> UnderReview
//!                                          |             |
//!                                      withdraw     approve | deny
//!                                          v             v
//!                                      Withdrawn   Approved | Denied
//! ```
//!
//! At most one open (`Pending`/`UnderReview`) appeal exists per identity
//! at any time.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditError, AuditLog, AuditOutcome};
use crate::blob::{BlobError, BlobStore};
use crate::identity::VerificationStatus;
use crate::ingest::{self, DocumentKind, IngestError};
use crate::machine::{VerificationError, VerificationStateMachine};
use crate::store::{AppealStore, StoreError};

/// Errors that can occur during appeal operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppealError {
    /// The identity's status does not allow this appeal operation.
    #[error("appeal operation not valid for identity {identity_id} in status {status}")]
    InvalidIdentityState {
        /// The identity involved.
        identity_id: String,
        /// Its status at the time of the attempt.
        status: VerificationStatus,
    },

    /// An open appeal already exists for this identity.
    #[error("identity {identity_id} already has an open appeal: {appeal_id}")]
    AlreadyOpen {
        /// The identity involved.
        identity_id: String,
        /// The existing open appeal.
        appeal_id: String,
    },

    /// The appeal has already been resolved or withdrawn.
    #[error("appeal {appeal_id} is already terminal: {status}")]
    AlreadyTerminal {
        /// The appeal involved.
        appeal_id: String,
        /// Its terminal status.
        status: AppealStatus,
    },

    /// Withdrawal is only valid while the appeal is still `Pending`.
    #[error("appeal {appeal_id} cannot be withdrawn in status {status}")]
    NotWithdrawable {
        /// The appeal involved.
        appeal_id: String,
        /// Its current status.
        status: AppealStatus,
    },

    /// Withdrawal attempted by someone other than the identity's owner.
    #[error("appeal {appeal_id} does not belong to {caller}")]
    NotOwner {
        /// The appeal involved.
        appeal_id: String,
        /// Who attempted the withdrawal.
        caller: String,
    },

    /// Appeal not found.
    #[error("appeal not found: {appeal_id}")]
    NotFound {
        /// The appeal id that was not found.
        appeal_id: String,
    },

    /// Supplementary evidence failed ingestion.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// Blob storage failure.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// Audit log failure.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Failure in the underlying identity transition.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Storage backend fault.
    #[error("store error: {0}")]
    Storage(String),
}

impl From<StoreError> for AppealError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => Self::NotFound { appeal_id: id },
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Lifecycle status of an [`Appeal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealStatus {
    /// Opened, not yet picked up by staff.
    Pending,
    /// Staff review in progress.
    UnderReview,
    /// Granted; the identity was forced `verified`.
    Approved,
    /// Denied; the identity reverted to `rejected`.
    Denied,
    /// Withdrawn by the owner before review.
    Withdrawn,
}

impl AppealStatus {
    /// Stable string form, used for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Withdrawn => "withdrawn",
        }
    }

    /// Parses the stable string form produced by [`Self::as_str`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "under_review" => Some(Self::UnderReview),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "withdrawn" => Some(Self::Withdrawn),
            _ => None,
        }
    }

    /// Whether the appeal still blocks a new one from being opened.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::UnderReview)
    }

    /// Whether the appeal has reached a final state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_open()
    }
}

impl std::fmt::Display for AppealStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Staff decision on an appeal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealDecision {
    /// Grant the appeal and force the identity `verified`.
    Approved,
    /// Deny the appeal; the identity reverts to `rejected`.
    Denied,
}

/// A bounded re-review process attached to one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appeal {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// The identity being appealed.
    pub identity_id: String,

    /// Owner-supplied reason for the appeal.
    pub reason: String,

    /// Blob key of supplementary evidence, when provided.
    pub supplementary_evidence_key: Option<String>,

    /// Current status.
    pub status: AppealStatus,

    /// The terminal status the identity held when the appeal was opened;
    /// restored verbatim on withdrawal.
    pub prior_status: VerificationStatus,

    /// Staff user that resolved the appeal.
    pub reviewed_by: Option<String>,

    /// Staff notes from resolution.
    pub review_notes: Option<String>,

    /// Creation timestamp (epoch ms).
    pub created_at: u64,

    /// Resolution/withdrawal timestamp (epoch ms).
    pub reviewed_at: Option<u64>,
}

/// The appeal workflow controller.
///
/// Identity-status changes are delegated to the verification state
/// machine so they ride the same per-identity compare-and-swap.
pub struct AppealWorkflow {
    machine: Arc<VerificationStateMachine>,
    appeals: Arc<dyn AppealStore>,
    blobs: Arc<dyn BlobStore>,
    audit: Arc<dyn AuditLog>,
}

impl AppealWorkflow {
    /// Creates the workflow over shared collaborators.
    #[must_use]
    pub fn new(
        machine: Arc<VerificationStateMachine>,
        appeals: Arc<dyn AppealStore>,
        blobs: Arc<dyn BlobStore>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            machine,
            appeals,
            blobs,
            audit,
        }
    }

    /// Fetches an appeal by id.
    ///
    /// # Errors
    ///
    /// Returns [`AppealError::NotFound`] for unknown ids.
    pub fn get(&self, appeal_id: &str) -> Result<Appeal, AppealError> {
        Ok(self.appeals.get(appeal_id)?)
    }

    /// Opens an appeal for a `rejected`/`expired` identity.
    ///
    /// Supplementary evidence, when supplied, goes through the same
    /// ingestion pipeline as primary documents. The identity moves to
    /// `appealing` and remembers nothing itself — the appeal records the
    /// prior status for a potential withdrawal.
    ///
    /// # Errors
    ///
    /// - [`AppealError::InvalidIdentityState`] outside `rejected`/`expired`
    /// - [`AppealError::AlreadyOpen`] when an open appeal exists
    /// - [`AppealError::Ingest`] when the evidence fails validation
    pub fn open(
        &self,
        identity_id: &str,
        reason: &str,
        evidence: Option<(&[u8], DocumentKind)>,
        now_ms: u64,
    ) -> Result<Appeal, AppealError> {
        let identity = self.machine.get(identity_id)?;

        if !identity.status.accepts_appeal() {
            let err = AppealError::InvalidIdentityState {
                identity_id: identity_id.to_string(),
                status: identity.status,
            };
            self.record_failure(identity_id, AuditAction::AppealOpen, &err, None, now_ms);
            return Err(err);
        }

        if let Some(existing) = self.appeals.find_open(identity_id)? {
            let err = AppealError::AlreadyOpen {
                identity_id: identity_id.to_string(),
                appeal_id: existing.id,
            };
            self.record_failure(identity_id, AuditAction::AppealOpen, &err, None, now_ms);
            return Err(err);
        }

        let supplementary_evidence_key = match evidence {
            Some((raw, kind)) => {
                let document = match ingest::ingest(raw, kind) {
                    Ok(document) => document,
                    Err(err) => {
                        self.record_failure(
                            identity_id,
                            AuditAction::AppealOpen,
                            &err,
                            None,
                            now_ms,
                        );
                        return Err(err.into());
                    },
                };
                Some(self.blobs.put(&document.normalized)?)
            },
            None => None,
        };

        let appeal = Appeal {
            id: Uuid::new_v4().to_string(),
            identity_id: identity_id.to_string(),
            reason: reason.to_string(),
            supplementary_evidence_key,
            status: AppealStatus::Pending,
            prior_status: identity.status,
            reviewed_by: None,
            review_notes: None,
            created_at: now_ms,
            reviewed_at: None,
        };
        self.appeals.insert(&appeal)?;

        // Identity transition last; a lost race closes the fresh appeal
        // row again so no open appeal outlives a failed open.
        match self.machine.begin_appeal(identity_id, now_ms) {
            Ok(_) => {},
            Err(err) => {
                let mut closed = appeal.clone();
                closed.status = AppealStatus::Withdrawn;
                closed.reviewed_at = Some(now_ms);
                self.appeals.update(&closed)?;
                self.record_failure(identity_id, AuditAction::AppealOpen, &err, None, now_ms);
                return Err(err.into());
            },
        }

        let mut details = BTreeMap::new();
        details.insert("appeal_id".to_string(), appeal.id.clone());
        details.insert("reason".to_string(), reason.to_string());
        if let Some(key) = &appeal.supplementary_evidence_key {
            details.insert("evidence_key".to_string(), key.clone());
        }
        self.audit.record(AuditEntry::new(
            identity_id,
            AuditAction::AppealOpen,
            AuditOutcome::Success,
            details,
            Some(identity.owner_id),
            now_ms,
        ))?;

        Ok(appeal)
    }

    /// Marks a `Pending` appeal `UnderReview`.
    ///
    /// # Errors
    ///
    /// Returns [`AppealError::AlreadyTerminal`] if the appeal is closed.
    pub fn begin_review(
        &self,
        appeal_id: &str,
        staff_user: &str,
    ) -> Result<Appeal, AppealError> {
        let mut appeal = self.appeals.get(appeal_id)?;
        match appeal.status {
            AppealStatus::UnderReview => Ok(appeal),
            AppealStatus::Pending => {
                appeal.status = AppealStatus::UnderReview;
                appeal.reviewed_by = Some(staff_user.to_string());
                self.appeals.update(&appeal)?;
                Ok(appeal)
            },
            status => Err(AppealError::AlreadyTerminal {
                appeal_id: appeal_id.to_string(),
                status,
            }),
        }
    }

    /// Resolves an open appeal.
    ///
    /// `Approved` forces the identity `verified` through the state
    /// machine's staff-approval path; `Denied` reverts it to `rejected`
    /// with the review notes as the status reason.
    ///
    /// # Errors
    ///
    /// - [`AppealError::AlreadyTerminal`] if the appeal is closed
    /// - [`AppealError::InvalidIdentityState`] if the identity is no
    ///   longer `appealing`
    pub fn resolve(
        &self,
        appeal_id: &str,
        staff_user: &str,
        decision: AppealDecision,
        notes: Option<&str>,
        now_ms: u64,
    ) -> Result<Appeal, AppealError> {
        let mut appeal = self.appeals.get(appeal_id)?;

        if appeal.status.is_terminal() {
            let err = AppealError::AlreadyTerminal {
                appeal_id: appeal_id.to_string(),
                status: appeal.status,
            };
            self.record_failure(
                &appeal.identity_id,
                AuditAction::AppealResolve,
                &err,
                Some(staff_user.to_string()),
                now_ms,
            );
            return Err(err);
        }

        let identity = self.machine.get(&appeal.identity_id)?;
        if identity.status != VerificationStatus::Appealing {
            let err = AppealError::InvalidIdentityState {
                identity_id: appeal.identity_id.clone(),
                status: identity.status,
            };
            self.record_failure(
                &appeal.identity_id,
                AuditAction::AppealResolve,
                &err,
                Some(staff_user.to_string()),
                now_ms,
            );
            return Err(err);
        }

        match decision {
            AppealDecision::Approved => {
                self.machine
                    .manual_approve(&appeal.identity_id, staff_user, notes, now_ms)?;
            },
            AppealDecision::Denied => {
                let reason = notes.unwrap_or("appeal denied");
                self.machine.revert_appeal(
                    &appeal.identity_id,
                    VerificationStatus::Rejected,
                    Some(reason),
                    now_ms,
                )?;
            },
        }

        appeal.status = match decision {
            AppealDecision::Approved => AppealStatus::Approved,
            AppealDecision::Denied => AppealStatus::Denied,
        };
        appeal.reviewed_by = Some(staff_user.to_string());
        appeal.review_notes = notes.map(str::to_string);
        appeal.reviewed_at = Some(now_ms);
        self.appeals.update(&appeal)?;

        let mut details = BTreeMap::new();
        details.insert("appeal_id".to_string(), appeal.id.clone());
        details.insert("decision".to_string(), appeal.status.as_str().to_string());
        if let Some(notes) = notes {
            details.insert("notes".to_string(), notes.to_string());
        }
        self.audit.record(AuditEntry::new(
            &appeal.identity_id,
            AuditAction::AppealResolve,
            match decision {
                AppealDecision::Approved => AuditOutcome::Approved,
                AppealDecision::Denied => AuditOutcome::Denied,
            },
            details,
            Some(staff_user.to_string()),
            now_ms,
        ))?;

        Ok(appeal)
    }

    /// Owner-initiated withdrawal of a still-`Pending` appeal.
    ///
    /// Restores the identity to the terminal status it held before the
    /// appeal was opened.
    ///
    /// # Errors
    ///
    /// - [`AppealError::NotWithdrawable`] once review started or closed
    /// - [`AppealError::NotOwner`] when `caller` does not own the identity
    pub fn withdraw(
        &self,
        appeal_id: &str,
        caller: &str,
        now_ms: u64,
    ) -> Result<Appeal, AppealError> {
        let mut appeal = self.appeals.get(appeal_id)?;

        let identity = self.machine.get(&appeal.identity_id)?;
        if identity.owner_id != caller {
            return Err(AppealError::NotOwner {
                appeal_id: appeal_id.to_string(),
                caller: caller.to_string(),
            });
        }

        if appeal.status != AppealStatus::Pending {
            let err = AppealError::NotWithdrawable {
                appeal_id: appeal_id.to_string(),
                status: appeal.status,
            };
            self.record_failure(
                &appeal.identity_id,
                AuditAction::AppealWithdraw,
                &err,
                Some(caller.to_string()),
                now_ms,
            );
            return Err(err);
        }

        self.machine
            .revert_appeal(&appeal.identity_id, appeal.prior_status, None, now_ms)?;

        appeal.status = AppealStatus::Withdrawn;
        appeal.reviewed_at = Some(now_ms);
        self.appeals.update(&appeal)?;

        let mut details = BTreeMap::new();
        details.insert("appeal_id".to_string(), appeal.id.clone());
        details.insert(
            "restored_status".to_string(),
            appeal.prior_status.as_str().to_string(),
        );
        self.audit.record(AuditEntry::new(
            &appeal.identity_id,
            AuditAction::AppealWithdraw,
            AuditOutcome::Success,
            details,
            Some(caller.to_string()),
            now_ms,
        ))?;

        Ok(appeal)
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
}
