//! Identity state types and the allowed-transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of an [`Identity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Registered, no document uploaded yet.
    Pending,

    /// A document has been ingested and stored; automated review has not
    /// started.
    Uploaded,

    /// Automated review in progress, or finished below the auto-approve
    /// threshold and awaiting a human decision. The two are distinguished
    /// by whether `confidence_score` has been recorded.
    Processing,

    /// Verification granted, either automatically or by staff.
    Verified,

    /// Verification denied by staff or via a denied appeal.
    Rejected,

    /// An appeal is open (`pending` or `under_review`) for this identity.
    Appealing,

    /// The verification (or the underlying document) has lapsed.
    Expired,
}

impl VerificationStatus {
    /// Stable string form, used for persistence and audit details.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
            Self::Appealing => "appealing",
            Self::Expired => "expired",
        }
    }

    /// Parses the stable string form produced by [`Self::as_str`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "uploaded" => Some(Self::Uploaded),
            "processing" => Some(Self::Processing),
            "verified" => Some(Self::Verified),
            "rejected" => Some(Self::Rejected),
            "appealing" => Some(Self::Appealing),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Returns `true` if this status accepts a new document upload.
    #[must_use]
    pub const fn accepts_upload(self) -> bool {
        matches!(self, Self::Pending | Self::Rejected | Self::Expired)
    }

    /// Returns `true` if a staff decision (approve/reject) is valid from
    /// this status. `Appealing` is included because appeal resolution is
    /// routed through the same staff-decision path.
    #[must_use]
    pub const fn accepts_staff_decision(self) -> bool {
        matches!(self, Self::Uploaded | Self::Processing | Self::Appealing)
    }

    /// Returns `true` if an appeal may be opened from this status.
    #[must_use]
    pub const fn accepts_appeal(self) -> bool {
        matches!(self, Self::Rejected | Self::Expired)
    }

    /// Whether the edge `self -> to` exists in the lifecycle graph.
    ///
    /// Self-edges are not part of the graph; idempotent no-ops are handled
    /// by the state machine before consulting this table.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Uploaded)
                | (Self::Uploaded, Self::Processing)
                | (Self::Uploaded, Self::Verified)
                | (Self::Uploaded, Self::Rejected)
                | (Self::Processing, Self::Verified)
                | (Self::Processing, Self::Rejected)
                | (Self::Verified, Self::Expired)
                | (Self::Rejected, Self::Uploaded)
                | (Self::Rejected, Self::Appealing)
                | (Self::Expired, Self::Uploaded)
                | (Self::Expired, Self::Appealing)
                | (Self::Appealing, Self::Verified)
                | (Self::Appealing, Self::Rejected)
                | (Self::Appealing, Self::Expired)
        )
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The profile fields a person claims at registration time.
///
/// These are compared against OCR-extracted document fields by the
/// confidence matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Account identifier of the person being verified.
    pub owner_id: String,

    /// Full name as claimed.
    pub claimed_full_name: String,

    /// Institution identifier (catalog key or display name).
    pub claimed_institution_id: String,

    /// Student number, when the person supplied one.
    pub claimed_external_id: Option<String>,
}

/// One person's verification attempt and current trust state.
///
/// Mutated only via `VerificationStateMachine`; the `version` counter is
/// bumped by the identity store on every successful update and drives the
/// optimistic compare-and-swap that linearizes concurrent transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique identifier (UUID v4, assigned at registration).
    pub id: String,

    /// Account identifier of the person being verified.
    pub owner_id: String,

    /// Full name as claimed.
    pub claimed_full_name: String,

    /// Institution identifier as claimed.
    pub claimed_institution_id: String,

    /// Student number as claimed, if any.
    pub claimed_external_id: Option<String>,

    /// Blob-store key of the current document, once uploaded.
    pub document_key: Option<String>,

    /// SHA-256 of the original uploaded bytes (hex), for dedup/integrity.
    pub document_hash: Option<String>,

    /// Current lifecycle status.
    pub status: VerificationStatus,

    /// Confidence from the latest automated match attempt, in `[0.0, 1.0]`.
    pub confidence_score: Option<f64>,

    /// Free-text reason for the current status (rejection reason, etc.).
    pub status_reason: Option<String>,

    /// When verification was granted (epoch ms).
    pub verified_at: Option<u64>,

    /// Staff user that granted verification; `None` means system-approved.
    pub verified_by: Option<String>,

    /// Expiry of the underlying document itself (epoch ms), when known.
    pub document_expires_at: Option<u64>,

    /// Expiry of the verification grant (epoch ms).
    pub verification_expires_at: Option<u64>,

    /// Creation timestamp (epoch ms).
    pub created_at: u64,

    /// Last-update timestamp (epoch ms).
    pub updated_at: u64,

    /// Optimistic-concurrency counter, incremented by the store.
    pub version: u64,
}

impl Identity {
    /// Creates a new `Pending` identity from registration claims.
    ///
    /// This is the only constructor; there is no implicit creation hook on
    /// persistence.
    #[must_use]
    pub fn register(id: impl Into<String>, claims: IdentityClaims, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            owner_id: claims.owner_id,
            claimed_full_name: claims.claimed_full_name,
            claimed_institution_id: claims.claimed_institution_id,
            claimed_external_id: claims.claimed_external_id,
            document_key: None,
            document_hash: None,
            status: VerificationStatus::Pending,
            confidence_score: None,
            status_reason: None,
            verified_at: None,
            verified_by: None,
            document_expires_at: None,
            verification_expires_at: None,
            created_at: now_ms,
            updated_at: now_ms,
            version: 1,
        }
    }

    /// Returns `true` if the identity currently holds a valid verification.
    ///
    /// Callers must run the lazy expiry check first; this predicate does
    /// not consult the clock.
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        matches!(self.status, VerificationStatus::Verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_statuses() -> [VerificationStatus; 7] {
        [
            VerificationStatus::Pending,
            VerificationStatus::Uploaded,
            VerificationStatus::Processing,
            VerificationStatus::Verified,
            VerificationStatus::Rejected,
            VerificationStatus::Appealing,
            VerificationStatus::Expired,
        ]
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in all_statuses() {
            assert_eq!(VerificationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(VerificationStatus::parse("bogus"), None);
    }

    #[test]
    fn test_pending_only_reaches_uploaded() {
        for to in all_statuses() {
            let allowed = VerificationStatus::Pending.can_transition_to(to);
            assert_eq!(allowed, to == VerificationStatus::Uploaded);
        }
    }

    #[test]
    fn test_terminal_states_reenter_via_upload_or_appeal() {
        for from in [VerificationStatus::Rejected, VerificationStatus::Expired] {
            assert!(from.can_transition_to(VerificationStatus::Uploaded));
            assert!(from.can_transition_to(VerificationStatus::Appealing));
            assert!(!from.can_transition_to(VerificationStatus::Verified));
        }
    }

    #[test]
    fn test_verified_only_expires() {
        for to in all_statuses() {
            let allowed = VerificationStatus::Verified.can_transition_to(to);
            assert_eq!(allowed, to == VerificationStatus::Expired);
        }
    }

    #[test]
    fn test_register_starts_pending() {
        let claims = IdentityClaims {
            owner_id: "owner-1".to_string(),
            claimed_full_name: "Jane Doe".to_string(),
            claimed_institution_id: "uni-1".to_string(),
            claimed_external_id: None,
        };
        let identity = Identity::register("id-1", claims, 1_000);

        assert_eq!(identity.status, VerificationStatus::Pending);
        assert_eq!(identity.version, 1);
        assert!(identity.document_key.is_none());
        assert!(!identity.is_verified());
    }
}
