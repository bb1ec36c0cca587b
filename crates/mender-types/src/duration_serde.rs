//! Serde adapter for `Duration` config fields.
//!
//! Accepts either a bare integer (milliseconds) or a suffixed string such as
//! `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"1d"`. Serializes as `"<n>ms"`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", duration.as_millis()))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
        Raw::Text(s) => parse_duration_str(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse a suffixed duration string.
pub fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let parse = |val: &str| -> Result<u64, String> {
        val.trim()
            .parse()
            .map_err(|e| format!("invalid duration '{}': {}", s, e))
    };
    if let Some(val) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(val)?))
    } else if let Some(val) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(val)?))
    } else if let Some(val) = s.strip_suffix('m') {
        Ok(Duration::from_secs(parse(val)? * 60))
    } else if let Some(val) = s.strip_suffix('h') {
        Ok(Duration::from_secs(parse(val)? * 3600))
    } else if let Some(val) = s.strip_suffix('d') {
        Ok(Duration::from_secs(parse(val)? * 86400))
    } else {
        Err(format!("unknown duration format: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize, serde::Serialize)]
    struct Holder {
        #[serde(with = "crate::duration_serde")]
        wait: Duration,
    }

    #[test]
    fn parses_suffixed_strings() {
        assert_eq!(parse_duration_str("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration_str("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration_str("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration_str("1d"), Ok(Duration::from_secs(86_400)));
        assert!(parse_duration_str("soon").is_err());
    }

    #[test]
    fn accepts_integer_milliseconds() {
        let h: Holder = serde_json::from_str(r#"{"wait": 1500}"#).unwrap();
        assert_eq!(h.wait, Duration::from_millis(1500));
        let h: Holder = serde_json::from_str(r#"{"wait": "2s"}"#).unwrap();
        assert_eq!(h.wait, Duration::from_secs(2));
        assert_eq!(serde_json::to_string(&h).unwrap(), r#"{"wait":"2000ms"}"#);
    }
}
