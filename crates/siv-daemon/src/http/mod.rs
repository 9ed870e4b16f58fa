//! HTTP surface for the verification workflow.
//!
//! Three public endpoints:
//!
//! - `POST /verification/submit` — upload a document (and register the
//!   identity when no id is supplied); returns `202 Accepted` and enqueues
//!   the automated review.
//! - `GET /verification/status` — current status, with the lazy expiry
//!   check applied first so `verified` is never stale.
//! - `POST /verification/appeal` — open an appeal for a rejected/expired
//!   identity.
//!
//! Staff operations are deliberately not routed here; they belong to an
//! external admin surface calling the library directly.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use siv_core::appeal::{AppealError, AppealWorkflow};
use siv_core::identity::{Identity, IdentityClaims, VerificationStatus};
use siv_core::ingest::{DocumentKind, IngestError};
use siv_core::machine::{VerificationError, VerificationStateMachine};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::worker::ReviewJob;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The verification lifecycle controller.
    pub machine: Arc<VerificationStateMachine>,

    /// The appeal workflow controller.
    pub appeals: Arc<AppealWorkflow>,

    /// Queue feeding the review worker.
    pub jobs: mpsc::Sender<ReviewJob>,
}

/// Builds the public router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/verification/submit", post(submit))
        .route("/verification/status", get(status))
        .route("/verification/appeal", post(appeal))
        .with_state(state)
}

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body could not be interpreted.
    #[error("invalid request: {0}")]
    InvalidPayload(String),

    /// Ingestion rejected the document.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// The operation is not valid for the current lifecycle position.
    #[error("{0}")]
    InvalidState(String),

    /// An appeal is already open for the identity.
    #[error("{0}")]
    AppealAlreadyOpen(String),

    /// Lost a race on a transition; the client should retry.
    #[error("{0}")]
    Conflict(String),

    /// Unknown identity or appeal.
    #[error("{0}")]
    NotFound(String),

    /// Anything the client cannot act on.
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "InvalidPayload",
            Self::Ingest(err) => match err {
                IngestError::UnsupportedFormat { .. } => "UnsupportedFormat",
                IngestError::PayloadTooLarge { .. } => "PayloadTooLarge",
                _ => "InvalidImage",
            },
            Self::InvalidState(_) | Self::AppealAlreadyOpen(_) => "InvalidState",
            Self::Conflict(_) => "ConcurrentModification",
            Self::NotFound(_) => "NotFound",
            Self::Internal(_) => "Internal",
        }
    }

    /// HTTP status for this error.
    ///
    /// - Payload/ingestion problems and lifecycle violations: 400 Bad
    ///   Request
    /// - Already-open appeals and lost races: 409 Conflict
    /// - Unknown ids: 404 Not Found
    /// - Everything else: 500 Internal Server Error
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPayload(_) | Self::Ingest(_) | Self::InvalidState(_) => {
                StatusCode::BAD_REQUEST
            },
            Self::AppealAlreadyOpen(_) | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<VerificationError> for ApiError {
    fn from(err: VerificationError) -> Self {
        match err {
            VerificationError::Ingest(inner) => Self::Ingest(inner),
            VerificationError::InvalidState { .. } => Self::InvalidState(err.to_string()),
            VerificationError::ConcurrentModification { .. } => Self::Conflict(err.to_string()),
            VerificationError::NotFound { .. } => Self::NotFound(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<AppealError> for ApiError {
    fn from(err: AppealError) -> Self {
        match err {
            AppealError::Ingest(inner) => Self::Ingest(inner),
            AppealError::AlreadyOpen { .. } => Self::AppealAlreadyOpen(err.to_string()),
            AppealError::InvalidIdentityState { .. }
            | AppealError::AlreadyTerminal { .. }
            | AppealError::NotWithdrawable { .. } => Self::InvalidState(err.to_string()),
            AppealError::NotFound { .. } => Self::NotFound(err.to_string()),
            AppealError::Verification(inner) => Self::from(inner),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Error body returned to clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable kind (`UnsupportedFormat`, `InvalidState`, ...).
    pub error: String,

    /// Human-readable message.
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            warn!(detail = %detail, "internal error on verification endpoint");
        }
        let body = ErrorBody {
            error: self.kind().to_string(),
            // Internal details stay out of client responses.
            message: if matches!(self, Self::Internal(_)) {
                "internal error".to_string()
            } else {
                self.to_string()
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// `POST /verification/submit` request body.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Existing identity to resubmit for; omitted on first submission.
    #[serde(default)]
    pub identity_id: Option<String>,

    /// Account id of the person being verified (first submission).
    #[serde(default)]
    pub owner_id: Option<String>,

    /// Claimed full name (first submission).
    #[serde(default)]
    pub full_name: Option<String>,

    /// Claimed institution (first submission).
    #[serde(default)]
    pub institution_id: Option<String>,

    /// Claimed student number, if any.
    #[serde(default)]
    pub external_id: Option<String>,

    /// Declared content type of the document.
    pub content_type: String,

    /// The document, base64-encoded.
    pub document_base64: String,
}

/// `POST /verification/submit` response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// The identity the document was attached to.
    pub identity_id: String,

    /// Status after the upload (`uploaded`).
    pub status: VerificationStatus,
}

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let kind = DocumentKind::from_content_type(&request.content_type)?;
    let document = BASE64
        .decode(request.document_base64.as_bytes())
        .map_err(|err| ApiError::InvalidPayload(format!("document_base64: {err}")))?;

    let now = crate::now_ms();
    let identity_id = match request.identity_id {
        Some(id) => id,
        None => {
            let claims = IdentityClaims {
                owner_id: required(request.owner_id, "owner_id")?,
                claimed_full_name: required(request.full_name, "full_name")?,
                claimed_institution_id: required(request.institution_id, "institution_id")?,
                claimed_external_id: request.external_id,
            };
            state.machine.register(claims, now)?.id
        },
    };

    let identity = state
        .machine
        .submit_document(&identity_id, &document, kind, now)?;

    // The upload is already complete and audited; a full queue only means
    // the identity waits in `uploaded` for staff instead of the worker.
    if let Err(err) = state.jobs.try_send(ReviewJob {
        identity_id: identity.id.clone(),
    }) {
        warn!(identity_id = %identity.id, error = %err, "failed to enqueue review job");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            identity_id: identity.id,
            status: identity.status,
        }),
    ))
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value.ok_or_else(|| ApiError::InvalidPayload(format!("missing field: {field}")))
}

/// `GET /verification/status` query parameters.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// The identity to report on.
    pub identity_id: String,
}

/// `GET /verification/status` response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Lifecycle status.
    pub status: VerificationStatus,

    /// Human-readable status label.
    pub status_display: String,

    /// Coarse progress for UI meters: pending=0, uploaded=25,
    /// processing=50, appealing=75, verified=100, rejected/expired=0.
    pub progress_percent: u8,

    /// Whether a new document upload is currently accepted.
    pub can_upload: bool,

    /// Whether the identity holds a valid (non-expired) verification.
    pub is_verified: bool,

    /// Rejection reason, when rejected.
    pub rejection_reason: Option<String>,

    /// When verification was granted, RFC 3339.
    pub verified_at: Option<String>,
}

impl StatusResponse {
    fn from_identity(identity: &Identity) -> Self {
        Self {
            status: identity.status,
            status_display: status_display(identity.status).to_string(),
            progress_percent: progress_percent(identity.status),
            can_upload: identity.status.accepts_upload(),
            is_verified: identity.is_verified(),
            rejection_reason: if identity.status == VerificationStatus::Rejected {
                identity.status_reason.clone()
            } else {
                None
            },
            verified_at: identity.verified_at.and_then(format_ms),
        }
    }
}

/// Coarse progress mapping for UI meters.
#[must_use]
pub const fn progress_percent(status: VerificationStatus) -> u8 {
    match status {
        VerificationStatus::Pending
        | VerificationStatus::Rejected
        | VerificationStatus::Expired => 0,
        VerificationStatus::Uploaded => 25,
        VerificationStatus::Processing => 50,
        VerificationStatus::Appealing => 75,
        VerificationStatus::Verified => 100,
    }
}

const fn status_display(status: VerificationStatus) -> &'static str {
    match status {
        VerificationStatus::Pending => "Awaiting document upload",
        VerificationStatus::Uploaded => "Document received",
        VerificationStatus::Processing => "Verification in progress",
        VerificationStatus::Verified => "Verified",
        VerificationStatus::Rejected => "Verification rejected",
        VerificationStatus::Appealing => "Appeal under review",
        VerificationStatus::Expired => "Verification expired",
    }
}

fn format_ms(ms: u64) -> Option<String> {
    DateTime::from_timestamp_millis(i64::try_from(ms).ok()?)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}

async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    // Lazy expiry first: a lapsed `verified` must never be reported.
    let identity = state
        .machine
        .check_expiration(&query.identity_id, crate::now_ms())?;
    Ok(Json(StatusResponse::from_identity(&identity)))
}

/// `POST /verification/appeal` request body.
#[derive(Debug, Deserialize)]
pub struct AppealRequest {
    /// The identity to appeal.
    pub identity_id: String,

    /// Why the decision should be reconsidered.
    pub reason: String,

    /// Supplementary evidence, base64-encoded.
    #[serde(default)]
    pub evidence_base64: Option<String>,

    /// Declared content type of the evidence.
    #[serde(default)]
    pub content_type: Option<String>,
}

/// `POST /verification/appeal` response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppealResponse {
    /// The opened appeal.
    pub appeal_id: String,
}

async fn appeal(
    State(state): State<AppState>,
    Json(request): Json<AppealRequest>,
) -> Result<(StatusCode, Json<AppealResponse>), ApiError> {
    let evidence = match (&request.evidence_base64, &request.content_type) {
        (Some(encoded), Some(content_type)) => {
            let kind = DocumentKind::from_content_type(content_type)?;
            let bytes = BASE64
                .decode(encoded.as_bytes())
                .map_err(|err| ApiError::InvalidPayload(format!("evidence_base64: {err}")))?;
            Some((bytes, kind))
        },
        (Some(_), None) => {
            return Err(ApiError::InvalidPayload(
                "content_type is required with evidence_base64".to_string(),
            ));
        },
        _ => None,
    };

    let appeal = state.appeals.open(
        &request.identity_id,
        &request.reason,
        evidence.as_ref().map(|(bytes, kind)| (bytes.as_slice(), *kind)),
        crate::now_ms(),
    )?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AppealResponse { appeal_id: appeal.id }),
    ))
}
