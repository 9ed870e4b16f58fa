//! Confidence matching between claimed profile fields and OCR extraction.
//!
//! The matcher produces a bounded confidence score via weighted partial
//! credit: a name substring match, an exact external-id match, and an
//! institution substring match each contribute their weight, and the score
//! is the sum of satisfied components (clamped to `[0.0, 1.0]`).
//!
//! The default weights (0.4/0.3/0.3) and the 0.8 auto-approve threshold are
//! deliberate conservative defaults with no documented calibration; they are
//! carried as plain data so deployments can tune them from labeled review
//! outcomes instead of treating them as fixed truths.

use serde::{Deserialize, Serialize};

/// Confidence at or above which verification is granted without a human.
///
/// Compared with `>=`, so a confidence of exactly 0.8 auto-approves.
pub const AUTO_APPROVE_THRESHOLD: f64 = 0.8;

/// Fields extracted from the document by the external OCR collaborator.
///
/// All fields are optional; the engine reports only what it could read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFields {
    /// Name as printed on the document.
    pub name: Option<String>,

    /// Student number as printed on the document.
    pub external_id: Option<String>,

    /// Institution name as printed on the document.
    pub institution_name: Option<String>,

    /// Document expiry date as printed, `YYYY-MM-DD`.
    pub expiry_date: Option<String>,
}

/// Per-component weights for the confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchWeights {
    /// Contribution of a satisfied name match.
    pub name: f64,

    /// Contribution of a satisfied external-id match.
    pub external_id: f64,

    /// Contribution of a satisfied institution match.
    pub institution: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            name: 0.4,
            external_id: 0.3,
            institution: 0.3,
        }
    }
}

/// The claimed fields the matcher compares against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedFields<'a> {
    /// Full name as claimed at registration.
    pub full_name: &'a str,

    /// Institution identifier or display name as claimed.
    pub institution: &'a str,

    /// Student number as claimed, if supplied.
    pub external_id: Option<&'a str>,
}

/// Outcome of one match attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Bounded confidence in `[0.0, 1.0]`.
    pub confidence: f64,

    /// Component names that matched (`name`, `external_id`, `institution`).
    pub matched_fields: Vec<String>,

    /// Component names that were present but did not match.
    pub mismatched_fields: Vec<String>,
}

/// Lowercases and collapses internal whitespace for tolerant comparison.
fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Substring match in either direction after normalization.
///
/// OCR output often carries surrounding text (titles, card boilerplate), so
/// containment rather than equality is the useful test for names and
/// institutions.
fn fuzzy_contains(claimed: &str, extracted: &str) -> bool {
    let claimed = normalize(claimed);
    let extracted = normalize(extracted);
    if claimed.is_empty() || extracted.is_empty() {
        return false;
    }
    extracted.contains(&claimed) || claimed.contains(&extracted)
}

/// Scores extracted fields against the claimed profile.
///
/// A component contributes its weight when both sides are present and
/// match; a component whose claimed side is absent is skipped entirely (no
/// credit, no mismatch). The result is monotonic: satisfying an additional
/// component never lowers the confidence.
#[must_use]
pub fn evaluate(
    extracted: &ExtractedFields,
    claimed: &ClaimedFields<'_>,
    weights: &MatchWeights,
) -> MatchResult {
    let mut confidence = 0.0_f64;
    let mut matched_fields = Vec::new();
    let mut mismatched_fields = Vec::new();

    let mut component = |label: &str, weight: f64, satisfied: Option<bool>| match satisfied {
        Some(true) => {
            confidence += weight;
            matched_fields.push(label.to_string());
        },
        Some(false) => mismatched_fields.push(label.to_string()),
        None => {},
    };

    component(
        "name",
        weights.name,
        extracted
            .name
            .as_deref()
            .map(|name| fuzzy_contains(claimed.full_name, name)),
    );

    // Exact match only: student numbers are opaque tokens where partial
    // agreement means nothing. Skipped when the claim carries no number.
    component(
        "external_id",
        weights.external_id,
        claimed.external_id.map(|claimed_id| {
            extracted
                .external_id
                .as_deref()
                .is_some_and(|extracted_id| extracted_id.trim() == claimed_id.trim())
        }),
    );

    component(
        "institution",
        weights.institution,
        extracted
            .institution_name
            .as_deref()
            .map(|institution| fuzzy_contains(claimed.institution, institution)),
    );

    MatchResult {
        confidence: confidence.clamp(0.0, 1.0),
        matched_fields,
        mismatched_fields,
    }
}
