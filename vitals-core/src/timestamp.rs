//! Timestamp normalization.
//!
//! Every upstream time representation is converted to a signed 64-bit
//! millisecond epoch. Precision is never truncated: sub-millisecond input is
//! rounded to the nearest millisecond, with an exact half-millisecond rounding
//! toward positive infinity.
//!
//! Accepted inputs:
//! - RFC 3339 strings with `Z` or a numeric offset and any number of fractional digits
//! - ISO-8601 strings without an offset, read as UTC
//! - JSON integers and decimal strings, read as epoch milliseconds
//! - JSON floats, read as epoch milliseconds with a fractional part

use crate::error::IngestError;
use crate::Timestamp;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const NANOS_PER_MILLI: u32 = 1_000_000;
const HALF_MILLI_NANOS: u32 = 500_000;

/// `0000-01-01T00:00:00.000Z`, the earliest instant RFC 3339 can spell.
pub const MIN_TIMESTAMP_MS: i64 = -62_167_219_200_000;
/// `9999-12-31T23:59:59.999Z`, the latest instant RFC 3339 can spell.
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// Naive layouts tried after RFC 3339 fails; all are read as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// An upstream time value as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTime {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for RawTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawTime::Integer(v) => write!(f, "{}", v),
            RawTime::Float(v) => write!(f, "{}", v),
            RawTime::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RawTime {
    fn from(s: &str) -> Self {
        RawTime::Text(s.to_string())
    }
}

impl From<i64> for RawTime {
    fn from(v: i64) -> Self {
        RawTime::Integer(v)
    }
}

/// Convert an upstream time representation to epoch milliseconds.
pub fn normalize(raw: &RawTime) -> Result<i64, IngestError> {
    match raw {
        RawTime::Integer(ms) => Ok(*ms),
        RawTime::Float(ms) => float_millis(*ms, &raw.to_string()),
        RawTime::Text(s) => normalize_str(s),
    }
}

/// Convert a textual timestamp to epoch milliseconds.
pub fn normalize_str(input: &str) -> Result<i64, IngestError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(malformed(input, "empty timestamp"));
    }

    if is_decimal_literal(s) {
        if let Ok(ms) = s.parse::<i64>() {
            return Ok(ms);
        }
        let value: f64 = s
            .parse()
            .map_err(|_| malformed(input, "unparseable numeric timestamp"))?;
        return float_millis(value, input);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return datetime_millis(&dt.with_timezone(&Utc), input);
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return datetime_millis(&naive.and_utc(), input);
        }
    }

    Err(malformed(input, "not an RFC 3339, ISO-8601 or epoch-millisecond value"))
}

/// Round a `DateTime` to epoch milliseconds.
pub fn datetime_millis(dt: &DateTime<Utc>, input: &str) -> Result<i64, IngestError> {
    // Leap-second representations carry nanos >= 1e9; clamp into the second.
    let nanos = dt.timestamp_subsec_nanos().min(999_999_999);
    let rounded = i64::from((nanos + HALF_MILLI_NANOS) / NANOS_PER_MILLI);
    dt.timestamp()
        .checked_mul(1000)
        .and_then(|ms| ms.checked_add(rounded))
        .ok_or_else(|| malformed(input, "timestamp out of range"))
}

/// Render epoch milliseconds as RFC 3339 with an explicit UTC offset.
pub fn format_rfc3339(ms: i64) -> Option<String> {
    millis_to_datetime(ms).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

pub fn millis_to_datetime(ms: i64) -> Option<Timestamp> {
    DateTime::from_timestamp_millis(ms)
}

fn float_millis(value: f64, input: &str) -> Result<i64, IngestError> {
    if !value.is_finite() {
        return Err(malformed(input, "non-finite numeric timestamp"));
    }
    let rounded = (value + 0.5).floor();
    if rounded < i64::MIN as f64 || rounded >= i64::MAX as f64 {
        return Err(malformed(input, "timestamp out of range"));
    }
    Ok(rounded as i64)
}

fn is_decimal_literal(s: &str) -> bool {
    let body = s.strip_prefix(['-', '+']).unwrap_or(s);
    !body.is_empty()
        && body.chars().any(|c| c.is_ascii_digit())
        && body.chars().all(|c| c.is_ascii_digit() || c == '.')
        && body.chars().filter(|c| *c == '.').count() <= 1
}

fn malformed(input: &str, reason: &str) -> IngestError {
    IngestError::MalformedTimestamp {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}
