//! CLI parsing helpers for clap value parsers.

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::engine::MAX_JOBS;

pub(super) fn parse_jobs(s: &str) -> Result<usize, String> {
    let value: usize = s
        .parse()
        .map_err(|_| format!("{s} is not a valid number"))?;
    if (1..=MAX_JOBS).contains(&value) {
        Ok(value)
    } else {
        Err(format!("jobs must be between 1 and {MAX_JOBS}"))
    }
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub(super) fn parse_date(s: &str) -> Result<OffsetDateTime, String> {
    let trimmed = s.trim();
    if let Ok(at) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(at);
    }
    Date::parse(trimmed, format_description!("[year]-[month]-[day]"))
        .map(|date| date.midnight().assume_utc())
        .map_err(|_| format!("'{s}' is neither an RFC 3339 timestamp nor a YYYY-MM-DD date"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::datetime;

    #[rstest]
    #[case("1", Some(1))]
    #[case("64", Some(64))]
    #[case("0", None)]
    #[case("65", None)]
    #[case("four", None)]
    fn jobs_are_bounded(#[case] raw: &str, #[case] expected: Option<usize>) {
        assert_eq!(parse_jobs(raw).ok(), expected);
    }

    #[rstest]
    #[case("2025-03-01", datetime!(2025-03-01 0:00 UTC))]
    #[case("2025-03-01T12:30:00Z", datetime!(2025-03-01 12:30 UTC))]
    #[case("2025-03-01T12:30:00+02:00", datetime!(2025-03-01 10:30 UTC))]
    fn dates_accept_both_forms(#[case] raw: &str, #[case] expected: OffsetDateTime) {
        assert_eq!(parse_date(raw).expect("date"), expected);
    }

    #[test]
    fn dates_reject_garbage() {
        assert!(parse_date("last tuesday").is_err());
    }
}
