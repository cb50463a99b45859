//! Relative timestamps such as `1 day`, `2 weeks 3 hours` or `-30 minutes`
//!
//! Months are 30 days and years 365 days.

use chrono::{DateTime, Duration, Utc};

/// Format of every timestamp written into a task definition
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

fn unit_seconds(unit: &str) -> Option<i64> {
    let seconds = match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "wk" | "week" | "weeks" => 7 * 86_400,
        "mo" | "month" | "months" => 30 * 86_400,
        "y" | "yr" | "yrs" | "year" | "years" => 365 * 86_400,
        _ => return None,
    };
    Some(seconds)
}

/// Parse an offset made of one or more `<amount> <unit>` terms. A leading
/// `-` negates the whole offset. Returns `None` for anything else.
pub fn parse_offset(input: &str) -> Option<Duration> {
    let trimmed = input.trim();
    let (negative, mut rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed),
    };

    let mut total = Duration::zero();
    let mut terms = 0;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let amount: i64 = rest[..digits].parse().ok()?;
        rest = rest[digits..].trim_start();

        let letters = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        if letters == 0 {
            return None;
        }
        let seconds = amount.checked_mul(unit_seconds(&rest[..letters])?)?;
        total = total.checked_add(&Duration::try_seconds(seconds)?)?;
        rest = rest[letters..].trim_start();
        terms += 1;
    }

    if terms == 0 {
        return None;
    }
    Some(if negative { -total } else { total })
}

/// `now` shifted by the offset in `input`
pub fn relative_to(input: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    now.checked_add_signed(parse_offset(input)?)
}

pub fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.format(TIMESTAMP_FORMAT).to_string()
}

/// Offset `input` from `now`, formatted for a task definition
pub fn json_time_from_now(input: &str, now: DateTime<Utc>) -> Option<String> {
    relative_to(input, now).map(format_timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_single_terms() {
        assert_eq!(parse_offset("0 seconds"), Some(Duration::zero()));
        assert_eq!(parse_offset("1 day"), Some(Duration::days(1)));
        assert_eq!(parse_offset("28 days"), Some(Duration::days(28)));
        assert_eq!(parse_offset("1 year"), Some(Duration::days(365)));
        assert_eq!(parse_offset("2 months"), Some(Duration::days(60)));
        assert_eq!(parse_offset("90min"), Some(Duration::minutes(90)));
        assert_eq!(parse_offset("3h"), Some(Duration::hours(3)));
    }

    #[test]
    fn test_compound_and_negative() {
        assert_eq!(
            parse_offset("1 day 2 hours"),
            Some(Duration::days(1) + Duration::hours(2))
        );
        assert_eq!(parse_offset("-30 minutes"), Some(Duration::minutes(-30)));
        assert_eq!(
            parse_offset(" - 1 week 1 s "),
            Some(-(Duration::weeks(1) + Duration::seconds(1)))
        );
    }

    #[test]
    fn test_malformed() {
        for input in ["", "-", "day", "1", "1 fortnight", "1 day and 2 hours", "1.5 days"] {
            assert_eq!(parse_offset(input), None, "input {:?}", input);
        }
        assert_eq!(parse_offset("99999999999999999999 years"), None);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(
            json_time_from_now("0 seconds", now()).unwrap(),
            "2024-03-01T12:00:00.000Z"
        );
        assert_eq!(
            json_time_from_now("1 day", now()).unwrap(),
            "2024-03-02T12:00:00.000Z"
        );
        assert_eq!(
            json_time_from_now("-1 hour", now()).unwrap(),
            "2024-03-01T11:00:00.000Z"
        );
    }
}
