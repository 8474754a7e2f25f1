use std::{str::FromStr, time::Duration};

/// Errors from parsing a Go-style duration string.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("negative durations are not valid here")]
    Negative,

    #[error("invalid floating-point number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

/// Parses a duration in Go's `time.ParseDuration` format, as used by
/// ServiceProfile route timeouts (e.g. "250ms", "1.5h", "2m30s").
pub fn parse_duration(s: &str) -> Result<Duration, ParseError> {
    GoDuration::from_str(s).map(|GoDuration(d)| d)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct GoDuration(Duration);

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(mut s: &str) -> Result<Self, Self::Err> {
        fn duration_from_units(val: f64, unit: &str) -> Result<Duration, ParseError> {
            const MINUTE: Duration = Duration::from_secs(60);
            let base = match unit {
                "ns" => Duration::from_nanos(1),
                // U+00B5 is the "micro sign"; U+03BC is "Greek letter mu".
                "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
                "ms" => Duration::from_millis(1),
                "s" => Duration::from_secs(1),
                "m" => MINUTE,
                "h" => MINUTE * 60,
                _ => return Err(ParseError::InvalidUnit),
            };
            Ok(base.mul_f64(val))
        }

        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        s = s.trim_start_matches('+');

        let mut total = Duration::from_secs(0);
        while !s.is_empty() {
            if let Some(unit_start) = s.find(|c: char| c.is_alphabetic()) {
                let (val, rest) = s.split_at(unit_start);
                let val = val.parse::<f64>()?;
                let unit = if let Some(next_numeric_start) =
                    rest.find(|c: char| !c.is_alphabetic())
                {
                    let (unit, rest) = rest.split_at(next_numeric_start);
                    s = rest;
                    unit
                } else {
                    s = "";
                    rest
                };
                total += duration_from_units(val, unit)?;
            } else if s == "0" {
                return Ok(GoDuration(Duration::from_secs(0)));
            } else {
                return Err(ParseError::NoUnit);
            }
        }

        Ok(GoDuration(total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_durations() {
        assert_eq!(parse_duration("0").unwrap(), Duration::from_secs(0));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("2m30s").unwrap(), Duration::from_secs(150));
        assert_eq!(
            parse_duration("1h30m10s500ms").unwrap(),
            Duration::from_secs(5410) + Duration::from_millis(500)
        );
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!(parse_duration("10"), Err(ParseError::NoUnit));
        assert_eq!(parse_duration("10q"), Err(ParseError::InvalidUnit));
        assert_eq!(parse_duration("-10s"), Err(ParseError::Negative));
        assert!(matches!(
            parse_duration("s"),
            Err(ParseError::NotANumber(_))
        ));
    }
}
