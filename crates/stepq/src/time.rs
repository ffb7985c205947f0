//! Clock and duration/rate parsing
//!
//! All persisted timestamps are Unix seconds with sub-second precision
//! (`f64`). Config surfaces accept either `std::time::Duration` values or
//! the string forms `"100 ms"` (a duration) and `"100/s"` (a rate, which
//! normalizes to the minimum start-to-start spacing `UNIT/R`).

use std::time::Duration;

use chrono::Utc;

/// Current wall-clock time as Unix seconds.
pub fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Convert a duration to fractional seconds.
pub fn to_seconds(d: Duration) -> f64 {
    d.as_secs_f64()
}

/// Errors from parsing duration or rate strings
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseTimeError {
    /// The string did not match any recognized form
    #[error("unrecognized time expression: {0:?}")]
    Unrecognized(String),

    /// The unit suffix is not one of ms, s, m, h, d
    #[error("unknown time unit: {0:?}")]
    UnknownUnit(String),

    /// The numeric part did not parse or was not positive
    #[error("invalid amount in time expression: {0:?}")]
    InvalidAmount(String),
}

fn unit_duration(unit: &str) -> Result<Duration, ParseTimeError> {
    match unit {
        "ms" => Ok(Duration::from_millis(1)),
        "s" | "sec" | "second" | "seconds" => Ok(Duration::from_secs(1)),
        "m" | "min" | "minute" | "minutes" => Ok(Duration::from_secs(60)),
        "h" | "hour" | "hours" => Ok(Duration::from_secs(3600)),
        "d" | "day" | "days" => Ok(Duration::from_secs(86_400)),
        other => Err(ParseTimeError::UnknownUnit(other.to_string())),
    }
}

/// Parse a duration expression such as `"100 ms"`, `"1.5s"`, or `"2 m"`.
pub fn parse_duration(s: &str) -> Result<Duration, ParseTimeError> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| ParseTimeError::Unrecognized(s.to_string()))?;
    let (amount, unit) = trimmed.split_at(split);
    let amount: f64 = amount
        .parse()
        .map_err(|_| ParseTimeError::InvalidAmount(s.to_string()))?;
    if !(amount > 0.0) {
        return Err(ParseTimeError::InvalidAmount(s.to_string()));
    }
    Ok(unit_duration(unit.trim())?.mul_f64(amount))
}

/// Parse a rate expression such as `"100/s"` into the minimum
/// start-to-start spacing (`UNIT / R`).
///
/// `"100/s"` is 10 ms between starts; `"20/s"` is 50 ms.
pub fn parse_rate(s: &str) -> Result<Duration, ParseTimeError> {
    let trimmed = s.trim();
    let (amount, unit) = trimmed
        .split_once('/')
        .ok_or_else(|| ParseTimeError::Unrecognized(s.to_string()))?;
    let amount: f64 = amount
        .trim()
        .parse()
        .map_err(|_| ParseTimeError::InvalidAmount(s.to_string()))?;
    if !(amount > 0.0) {
        return Err(ParseTimeError::InvalidAmount(s.to_string()));
    }
    Ok(unit_duration(unit.trim())?.div_f64(amount))
}

/// Parse either form: `"100 ms"` or `"100/s"`.
pub fn parse_interval(s: &str) -> Result<Duration, ParseTimeError> {
    if s.contains('/') {
        parse_rate(s)
    } else {
        parse_duration(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("100 ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1.5 s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("3 m").unwrap(), Duration::from_secs(180));
    }

    #[test]
    fn test_parse_rate_is_spacing() {
        assert_eq!(parse_rate("100/s").unwrap(), Duration::from_millis(10));
        assert_eq!(parse_rate("20/s").unwrap(), Duration::from_millis(50));
        assert_eq!(parse_rate("1/m").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_interval_accepts_both() {
        assert_eq!(parse_interval("50 ms").unwrap(), Duration::from_millis(50));
        assert_eq!(parse_interval("100/s").unwrap(), Duration::from_millis(10));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10 fortnights").is_err());
        assert!(parse_rate("0/s").is_err());
        assert!(parse_rate("-3/s").is_err());
    }

    #[test]
    fn test_now_is_unix_seconds() {
        let t = now();
        // Well past 2020, well before 2100.
        assert!(t > 1_577_836_800.0);
        assert!(t < 4_102_444_800.0);
    }
}
