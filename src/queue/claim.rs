//! Claim staleness.
//!
//! A claim (an MR's assignee) is exclusive only while the MR record keeps
//! being touched. Once `updated_at` is at least `stale_claim_timeout` old the
//! claim is considered abandoned and the MR becomes eligible again, which is
//! how work held by a crashed refinery gets picked back up.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Decides whether a claim last touched at `updated_at` has gone stale.
///
/// A missing timestamp is never stale. An unparsable one is reported as an
/// error; callers log it and keep honoring the claim.
pub fn claim_is_stale(
    updated_at: Option<&str>,
    timeout: Duration,
    now: DateTime<Utc>,
) -> Result<bool, chrono::ParseError> {
    let Some(raw) = updated_at.filter(|s| !s.trim().is_empty()) else {
        return Ok(false);
    };
    let updated = DateTime::parse_from_rfc3339(raw.trim())?.with_timezone(&Utc);
    // Timestamps from the future (clock skew) count as fresh.
    let age = (now - updated).to_std().unwrap_or_default();
    Ok(age >= timeout)
}

/// Parses an RFC 3339 record timestamp, discarding invalid values.
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|t| t.with_timezone(&Utc))
}
