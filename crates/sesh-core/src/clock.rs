use chrono::{DateTime, Duration, Utc};

/// Symmetric clock-skew tolerance. Rejecting future timestamps as well as
/// past ones blocks pre-computed replay batches.
pub const MAX_CLOCK_SKEW_SECS: i64 = 120;

/// Outcome of client timestamp freshness validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampCheck {
    Fresh(DateTime<Utc>),
    /// Unparseable input.
    Invalid,
    /// Parsed but outside the skew window in either direction.
    Stale,
}

pub fn validate_timestamp(client_timestamp: &str) -> TimestampCheck {
    validate_timestamp_at(client_timestamp, Utc::now())
}

/// Clock-explicit variant of [`validate_timestamp`].
pub fn validate_timestamp_at(client_timestamp: &str, now: DateTime<Utc>) -> TimestampCheck {
    let parsed = match DateTime::parse_from_rfc3339(client_timestamp) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(_) => return TimestampCheck::Invalid,
    };

    if (now - parsed).abs() > Duration::seconds(MAX_CLOCK_SKEW_SECS) {
        TimestampCheck::Stale
    } else {
        TimestampCheck::Fresh(parsed)
    }
}
