//! Pure expiration computations.
//!
//! Expiry is enforced lazily: nothing in the workflow runs on a timer.
//! The state machine calls into these helpers at read time (and the daemon
//! may run the same check from a background sweep), so a `verified`
//! identity whose grant has lapsed flips to `expired` the first time
//! anyone looks at it.

use chrono::NaiveDate;

/// How long a verification grant remains valid (365 days, in ms).
pub const VERIFICATION_TTL_MS: u64 = 365 * 86_400_000;

/// Computes when a verification granted at `now_ms` expires.
#[must_use]
pub const fn verification_expires_at(now_ms: u64) -> u64 {
    now_ms + VERIFICATION_TTL_MS
}

/// Whether a deadline has passed. `None` never expires.
#[must_use]
pub fn is_expired(expires_at: Option<u64>, now_ms: u64) -> bool {
    expires_at.is_some_and(|deadline| now_ms > deadline)
}

/// Parses a document expiry date printed as `YYYY-MM-DD` into epoch ms
/// (midnight UTC). Absent or unparseable dates yield `None` rather than an
/// error: a bad expiry print must not fail the match attempt.
#[must_use]
pub fn document_expiry_ms(printed: &str) -> Option<u64> {
    let date = NaiveDate::parse_from_str(printed.trim(), "%Y-%m-%d").ok()?;
    let millis = date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
    u64::try_from(millis).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_ttl_is_365_days() {
        assert_eq!(verification_expires_at(0), 365 * 24 * 60 * 60 * 1000);
        assert_eq!(verification_expires_at(1_000), VERIFICATION_TTL_MS + 1_000);
    }

    #[test]
    fn test_is_expired_boundary() {
        assert!(!is_expired(Some(1_000), 1_000));
        assert!(is_expired(Some(1_000), 1_001));
        assert!(!is_expired(None, u64::MAX));
    }

    #[test]
    fn test_document_expiry_parsing() {
        // 2027-01-01T00:00:00Z
        assert_eq!(document_expiry_ms("2027-01-01"), Some(1_798_761_600_000));
        assert_eq!(document_expiry_ms(" 2027-01-01 "), Some(1_798_761_600_000));
        assert_eq!(document_expiry_ms("01/2027"), None);
        assert_eq!(document_expiry_ms(""), None);
        // Pre-epoch dates cannot be represented.
        assert_eq!(document_expiry_ms("1960-01-01"), None);
    }
}
