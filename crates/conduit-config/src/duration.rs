//! Human-readable durations (`90`, `30m`, `1 hour 30 minutes`).

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;

static NUMBER_UNIT_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d)\s+([A-Za-z])").unwrap());

/// Parse a duration string. Bare integers are seconds.
pub fn parse_duration_str(input: &str) -> Option<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let compact = NUMBER_UNIT_GAP.replace_all(trimmed, "$1$2");
    humantime::parse_duration(&compact).ok()
}

/// Parse a duration from a document value (integer seconds or a string).
pub fn parse_duration(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n.as_u64().map(Duration::from_secs),
        Value::String(s) => parse_duration_str(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_forms() {
        assert_eq!(parse_duration_str("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration_str("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(
            parse_duration_str("1 hour 30 minutes"),
            Some(Duration::from_secs(5400))
        );
        assert_eq!(parse_duration_str("1h 1s"), Some(Duration::from_secs(3601)));
        assert_eq!(parse_duration(&json!(15)), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_duration_str(""), None);
        assert_eq!(parse_duration_str("soon"), None);
        assert_eq!(parse_duration(&json!(true)), None);
        assert_eq!(parse_duration(&json!(-5)), None);
    }
}
