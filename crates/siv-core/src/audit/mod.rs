//! Append-only audit trail of workflow actions.
//!
//! Every state-changing operation in the verification and appeal workflows
//! records exactly one [`AuditEntry`] per attempt, including failed
//! attempts (with [`AuditOutcome::Error`]), so support staff can
//! reconstruct what happened even when the end user saw only a generic
//! failure. Entries are immutable: the [`AuditLog`] trait exposes no
//! update or delete path, and backends must not grow one.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while recording or querying audit entries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// Backend fault (I/O, database).
    #[error("audit log error: {0}")]
    Backend(String),
}

/// Workflow action being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Document submission.
    Upload,
    /// Automated review started.
    BeginReview,
    /// Automated review/match attempt.
    AutoVerify,
    /// Staff approval.
    ManualApprove,
    /// Staff rejection.
    ManualReject,
    /// Lazy expiration of a verified identity.
    Expire,
    /// Appeal opened.
    AppealOpen,
    /// Appeal resolved by staff.
    AppealResolve,
    /// Appeal withdrawn by its owner.
    AppealWithdraw,
}

impl AuditAction {
    /// Stable string form, used for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::BeginReview => "begin_review",
            Self::AutoVerify => "auto_verify",
            Self::ManualApprove => "manual_approve",
            Self::ManualReject => "manual_reject",
            Self::Expire => "expire",
            Self::AppealOpen => "appeal_open",
            Self::AppealResolve => "appeal_resolve",
            Self::AppealWithdraw => "appeal_withdraw",
        }
    }

    /// Parses the stable string form produced by [`Self::as_str`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upload" => Some(Self::Upload),
            "begin_review" => Some(Self::BeginReview),
            "auto_verify" => Some(Self::AutoVerify),
            "manual_approve" => Some(Self::ManualApprove),
            "manual_reject" => Some(Self::ManualReject),
            "expire" => Some(Self::Expire),
            "appeal_open" => Some(Self::AppealOpen),
            "appeal_resolve" => Some(Self::AppealResolve),
            "appeal_withdraw" => Some(Self::AppealWithdraw),
            _ => None,
        }
    }
}

/// Result of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The action completed.
    Success,
    /// An automated or staff decision granted verification.
    Approved,
    /// The automated pass finished below threshold; held for a human.
    Pending,
    /// A staff decision denied the request.
    Denied,
    /// The attempt failed; details carry the error.
    Error,
}

impl AuditOutcome {
    /// Stable string form, used for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Approved => "approved",
            Self::Pending => "pending",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }

    /// Parses the stable string form produced by [`Self::as_str`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "approved" => Some(Self::Approved),
            "pending" => Some(Self::Pending),
            "denied" => Some(Self::Denied),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One immutable audit record: an action/result pair with context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Sequence number assigned by the log on record.
    pub seq: Option<u64>,

    /// The identity this entry belongs to.
    pub identity_id: String,

    /// The audited action.
    pub action: AuditAction,

    /// The outcome of the action.
    pub result: AuditOutcome,

    /// Key-value context (confidence, reasons, error details). A
    /// `BTreeMap` keeps serialization order deterministic.
    pub details: BTreeMap<String, String>,

    /// Staff or owner that performed the action; `None` for the system.
    pub performed_by: Option<String>,

    /// When the action occurred (epoch ms).
    pub occurred_at: u64,
}

impl AuditEntry {
    /// Creates an entry ready for [`AuditLog::record`].
    #[must_use]
    pub fn new(
        identity_id: impl Into<String>,
        action: AuditAction,
        result: AuditOutcome,
        details: BTreeMap<String, String>,
        performed_by: Option<String>,
        occurred_at: u64,
    ) -> Self {
        Self {
            seq: None,
            identity_id: identity_id.into(),
            action,
            result,
            details,
            performed_by,
            occurred_at,
        }
    }
}

/// Append-only audit log.
///
/// Implementations must assign monotonically increasing sequence numbers
/// and must not expose any mutation of recorded entries.
pub trait AuditLog: Send + Sync {
    /// Appends an entry, returning it with its assigned sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Backend`] on storage faults.
    fn record(&self, entry: AuditEntry) -> Result<AuditEntry, AuditError>;

    /// Returns all entries for an identity, newest first (non-increasing
    /// `occurred_at`, ties broken by descending sequence).
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Backend`] on storage faults.
    fn query(&self, identity_id: &str) -> Result<Vec<AuditEntry>, AuditError>;
}

/// In-memory audit log.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditLog {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl MemoryAuditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of recorded entries across all identities.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (indicates a thread panic).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    /// Returns `true` if nothing has been recorded.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned (indicates a thread panic).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("lock poisoned").is_empty()
    }
}

impl AuditLog for MemoryAuditLog {
    fn record(&self, mut entry: AuditEntry) -> Result<AuditEntry, AuditError> {
        let mut entries = self.entries.write().expect("lock poisoned");
        entry.seq = Some(entries.len() as u64 + 1);
        entries.push(entry.clone());
        Ok(entry)
    }

    fn query(&self, identity_id: &str) -> Result<Vec<AuditEntry>, AuditError> {
        let entries = self.entries.read().expect("lock poisoned");
        let mut matching: Vec<AuditEntry> = entries
            .iter()
            .filter(|entry| entry.identity_id == identity_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.occurred_at
                .cmp(&a.occurred_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        Ok(matching)
    }
}
