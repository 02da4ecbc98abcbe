//! Duration literals used in configuration: `"250ms"`, `"1.5s"`, `"2m"`, or a number of
//! milliseconds. Sub-millisecond precision is written as `"us"` or `"ns"`.

use std::time::Duration;

use parse_display::Display;
use serde::{de, Deserialize, Deserializer, Serializer};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display("{0}")]
pub struct ParseDurationError(&'static str);

impl std::error::Error for ParseDurationError {}

pub fn parse(raw: &str) -> Result<Duration, ParseDurationError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ParseDurationError("duration literal is empty"));
    }

    let (number, unit_nanos) = if let Some(prefix) = s.strip_suffix("ns") {
        (prefix, 1.0)
    } else if let Some(prefix) = s.strip_suffix("us") {
        (prefix, 1e3)
    } else if let Some(prefix) = s.strip_suffix("ms") {
        (prefix, 1e6)
    } else if let Some(prefix) = s.strip_suffix('s') {
        (prefix, 1e9)
    } else if let Some(prefix) = s.strip_suffix('m') {
        (prefix, 60e9)
    } else {
        return Err(ParseDurationError("invalid duration literal"));
    };

    if number.is_empty() {
        return Err(ParseDurationError("invalid duration literal"));
    }
    let value: f64 = number
        .trim_end()
        .parse()
        .map_err(|_| ParseDurationError("invalid duration number"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ParseDurationError(
            "duration must be non-negative and finite",
        ));
    }

    let nanos = (value * unit_nanos).round();
    if nanos >= u64::MAX as f64 {
        return Err(ParseDurationError("duration is too large"));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

/// Writes the coarsest of `ms`, `us` and `ns` that loses nothing.
pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    let nanos = duration.subsec_nanos();
    if nanos % 1_000_000 == 0 {
        serializer.collect_str(&format_args!("{}ms", duration.as_millis()))
    } else if nanos % 1_000 == 0 {
        serializer.collect_str(&format_args!("{}us", duration.as_micros()))
    } else {
        serializer.collect_str(&format_args!("{}ns", duration.as_nanos()))
    }
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Literal(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Millis(millis) => Ok(Duration::from_millis(millis)),
        Raw::Literal(s) => parse(&s).map_err(de::Error::custom),
    }
}
