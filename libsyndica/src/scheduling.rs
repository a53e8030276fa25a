//! Schedule string parsing
//!
//! Accepts the formats people actually type on a CLI: relative durations
//! ("30m", "2h 15m"), natural language ("tomorrow", "next friday 10am"),
//! and "now".

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SyndicaError};

/// Parse a schedule string into a UTC timestamp.
///
/// # Errors
///
/// Returns `InvalidInput` when the string matches none of the supported
/// formats or the resulting time cannot be represented.
pub fn parse_schedule(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SyndicaError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if input.eq_ignore_ascii_case("now") {
        return Ok(Utc::now());
    }

    if let Ok(duration) = parse_duration(input) {
        return Ok(Utc::now() + duration);
    }

    if let Ok(dt) = parse_natural_language(input) {
        return Ok(dt);
    }

    Err(SyndicaError::InvalidInput(format!(
        "Could not parse schedule string: {}",
        input
    )))
}

/// Parse a schedule string straight to epoch millis, the unit the intent
/// table stores.
pub fn parse_schedule_millis(input: &str) -> Result<i64> {
    Ok(parse_schedule(input)?.timestamp_millis())
}

fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input)
        .map_err(|_| SyndicaError::InvalidInput(format!("Could not parse duration: {}", input)))?;

    Duration::try_seconds(std_duration.as_secs() as i64)
        .ok_or_else(|| SyndicaError::InvalidInput("Duration out of range".to_string()))
}

fn parse_natural_language(input: &str) -> Result<DateTime<Utc>> {
    chrono_english::parse_date_string(input, Utc::now(), chrono_english::Dialect::Us)
        .map_err(|e| SyndicaError::InvalidInput(format!("Could not parse time: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_now() {
        let parsed = parse_schedule("now").unwrap();
        let delta = (Utc::now() - parsed).num_seconds().abs();
        assert!(delta <= 1);
    }

    #[test]
    fn test_parse_relative_duration() {
        let parsed = parse_schedule("2h").unwrap();
        let delta = (parsed - Utc::now()).num_minutes();
        assert!((119..=120).contains(&delta));
    }

    #[test]
    fn test_parse_compound_duration() {
        let parsed = parse_schedule("1h 30m").unwrap();
        let delta = (parsed - Utc::now()).num_minutes();
        assert!((89..=90).contains(&delta));
    }

    #[test]
    fn test_parse_natural_language() {
        let parsed = parse_schedule("tomorrow").unwrap();
        assert!(parsed > Utc::now());
    }

    #[test]
    fn test_empty_rejected() {
        assert!(parse_schedule("").is_err());
        assert!(parse_schedule("   ").is_err());
    }

    #[test]
    fn test_gibberish_rejected() {
        assert!(parse_schedule("whenever feels right ok").is_err());
    }

    #[test]
    fn test_parse_millis() {
        let millis = parse_schedule_millis("10m").unwrap();
        assert!(millis > Utc::now().timestamp_millis());
    }
}
