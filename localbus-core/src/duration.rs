//! ISO-8601 duration parsing and formatting
//!
//! The admin surface serializes durations as `PT60S` / `P14D`. The parser is
//! more permissive than the formatter: it accepts composite durations with
//! years (365 days), months (30 days), days, hours, minutes, and fractional
//! seconds.

use std::fmt;
use std::time::Duration;

/// Error when parsing an invalid ISO-8601 duration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationParseError(pub String);

impl fmt::Display for DurationParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid ISO 8601 duration: {}", self.0)
    }
}

impl std::error::Error for DurationParseError {}

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Parse an ISO-8601 duration (`PT60S`, `PT1H30M`, `P14D`, `P1Y2M3DT4H`).
pub fn parse_iso8601_duration(input: &str) -> Result<Duration, DurationParseError> {
    let rest = input
        .strip_prefix('P')
        .ok_or_else(|| DurationParseError(input.to_string()))?;
    if rest.is_empty() {
        return Err(DurationParseError(input.to_string()));
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => (date, time),
        None => (rest, ""),
    };

    let mut total_seconds = 0.0f64;
    let mut saw_component = false;

    for (value, designator) in components(date_part, input)? {
        saw_component = true;
        total_seconds += match designator {
            'Y' => value * 365.0 * SECONDS_PER_DAY,
            'M' => value * 30.0 * SECONDS_PER_DAY,
            'W' => value * 7.0 * SECONDS_PER_DAY,
            'D' => value * SECONDS_PER_DAY,
            _ => return Err(DurationParseError(input.to_string())),
        };
    }

    for (value, designator) in components(time_part, input)? {
        saw_component = true;
        total_seconds += match designator {
            'H' => value * 3600.0,
            'M' => value * 60.0,
            'S' => value,
            _ => return Err(DurationParseError(input.to_string())),
        };
    }

    if !saw_component || !total_seconds.is_finite() || total_seconds < 0.0 {
        return Err(DurationParseError(input.to_string()));
    }

    Ok(Duration::from_secs_f64(total_seconds))
}

/// Split a duration segment into `(number, designator)` pairs.
fn components(segment: &str, original: &str) -> Result<Vec<(f64, char)>, DurationParseError> {
    let mut out = Vec::new();
    let mut number = String::new();
    for c in segment.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else if c.is_ascii_uppercase() {
            let value: f64 = number
                .parse()
                .map_err(|_| DurationParseError(original.to_string()))?;
            out.push((value, c));
            number.clear();
        } else {
            return Err(DurationParseError(original.to_string()));
        }
    }
    if !number.is_empty() {
        // Trailing digits with no designator
        return Err(DurationParseError(original.to_string()));
    }
    Ok(out)
}

/// Format a duration canonically: whole days as `P{n}D`, everything else as
/// `PT{n}S`.
pub fn format_iso8601_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds > 0 && seconds % 86_400 == 0 {
        format!("P{}D", seconds / 86_400)
    } else {
        format!("PT{}S", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_forms() {
        assert_eq!(parse_iso8601_duration("PT60S").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_iso8601_duration("PT1M").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_iso8601_duration("PT1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_iso8601_duration("P1D").unwrap(), Duration::from_secs(86_400));
        assert_eq!(
            parse_iso8601_duration("P14D").unwrap(),
            Duration::from_secs(14 * 86_400)
        );
    }

    #[test]
    fn test_parse_composite_forms() {
        assert_eq!(
            parse_iso8601_duration("P1DT2H30M").unwrap(),
            Duration::from_secs(86_400 + 2 * 3600 + 30 * 60)
        );
        assert_eq!(
            parse_iso8601_duration("P1Y").unwrap(),
            Duration::from_secs(365 * 86_400)
        );
        assert_eq!(
            parse_iso8601_duration("P2M").unwrap(),
            Duration::from_secs(60 * 86_400)
        );
    }

    #[test]
    fn test_parse_fractional_seconds() {
        assert_eq!(
            parse_iso8601_duration("PT0.5S").unwrap(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for input in ["", "P", "14D", "PTS", "PT5X", "PT5"] {
            assert!(parse_iso8601_duration(input).is_err(), "{} accepted", input);
        }
    }

    #[test]
    fn test_format_canonical() {
        assert_eq!(format_iso8601_duration(Duration::from_secs(60)), "PT60S");
        assert_eq!(
            format_iso8601_duration(Duration::from_secs(14 * 86_400)),
            "P14D"
        );
        assert_eq!(format_iso8601_duration(Duration::from_secs(90)), "PT90S");
    }

    #[test]
    fn test_roundtrip_via_parser() {
        for duration in [Duration::from_secs(1), Duration::from_secs(600), Duration::from_secs(86_400)] {
            let formatted = format_iso8601_duration(duration);
            assert_eq!(parse_iso8601_duration(&formatted).unwrap(), duration);
        }
    }

    proptest::proptest! {
        #[test]
        fn formatted_durations_always_reparse(secs in 0u64..1_000_000) {
            let duration = Duration::from_secs(secs);
            let formatted = format_iso8601_duration(duration);
            proptest::prop_assert_eq!(parse_iso8601_duration(&formatted).unwrap(), duration);
        }
    }
}
