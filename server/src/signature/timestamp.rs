//! Timestamp parsing and freshness checks.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use super::context::TimestampFormat;
use super::error::SignatureError;

/// Parse a provider timestamp in exactly the declared format.
pub fn parse(format: TimestampFormat, raw: &str) -> Result<DateTime<Utc>, SignatureError> {
    let raw = raw.trim();
    let invalid = || SignatureError::InvalidTimestamp(format!("{raw:?} is not {format:?}"));

    match format {
        TimestampFormat::EpochSeconds => {
            if !is_unsigned_integer(raw) {
                return Err(invalid());
            }
            let secs: i64 = raw.parse().map_err(|_| invalid())?;
            Utc.timestamp_opt(secs, 0).single().ok_or_else(invalid)
        }
        TimestampFormat::EpochMillis => {
            if !is_unsigned_integer(raw) {
                return Err(invalid());
            }
            let millis: i64 = raw.parse().map_err(|_| invalid())?;
            Utc.timestamp_millis_opt(millis).single().ok_or_else(invalid)
        }
        TimestampFormat::Rfc3339 => DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| invalid()),
    }
}

/// Reject timestamps outside `[now - max_skew, now + max_skew]`.
pub fn check_freshness(
    signed_at: DateTime<Utc>,
    now: DateTime<Utc>,
    max_skew: Duration,
) -> Result<(), SignatureError> {
    let skew_ms = i64::try_from(max_skew.as_millis()).unwrap_or(i64::MAX);
    let age_ms = (now - signed_at).num_milliseconds();

    if age_ms > skew_ms {
        return Err(SignatureError::ReplayTooOld {
            age_secs: age_ms / 1000,
            max_skew_secs: max_skew.as_secs(),
        });
    }
    if -age_ms > skew_ms {
        return Err(SignatureError::InvalidTimestamp(format!(
            "timestamp is {}s in the future",
            -age_ms / 1000
        )));
    }
    Ok(())
}

fn is_unsigned_integer(raw: &str) -> bool {
    !raw.is_empty() && raw.len() <= 16 && raw.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_format() {
        let secs = parse(TimestampFormat::EpochSeconds, "1760616000").unwrap();
        let millis = parse(TimestampFormat::EpochMillis, "1760616000000").unwrap();
        let iso = parse(TimestampFormat::Rfc3339, "2025-10-16T12:00:00Z").unwrap();
        assert_eq!(secs, millis);
        assert_eq!(secs, iso);
    }

    #[test]
    fn does_not_guess_between_formats() {
        // An ISO string is not accepted where epoch seconds are declared.
        assert!(parse(TimestampFormat::EpochSeconds, "2025-10-16T12:00:00Z").is_err());
        assert!(parse(TimestampFormat::Rfc3339, "1760616000").is_err());
        assert!(parse(TimestampFormat::EpochSeconds, "-5").is_err());
        assert!(parse(TimestampFormat::EpochSeconds, "").is_err());
        assert!(parse(TimestampFormat::EpochMillis, "17606160e3").is_err());
    }

    #[test]
    fn freshness_window_is_symmetric() {
        let now = Utc.timestamp_opt(1_760_616_000, 0).unwrap();
        let skew = Duration::from_secs(300);

        assert!(check_freshness(now, now, skew).is_ok());
        assert!(check_freshness(now - chrono::Duration::seconds(300), now, skew).is_ok());

        let stale = check_freshness(now - chrono::Duration::seconds(301), now, skew);
        assert!(matches!(stale, Err(SignatureError::ReplayTooOld { age_secs: 301, .. })));

        let future = check_freshness(now + chrono::Duration::seconds(301), now, skew);
        assert!(matches!(future, Err(SignatureError::InvalidTimestamp(_))));
    }
}
