//! Timestamp decoding for inserted data and read filters
//!
//! Devices send either integer epoch seconds or ISO-8601 strings. Naive
//! strings (no offset) are taken as UTC.

use crate::error::{BrokerError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Formats tried, in order, for strings without an explicit offset
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// A timestamp as received, before interpretation
#[derive(Debug, Clone, PartialEq)]
pub enum RawTimestamp {
    /// Already structured
    Instant(DateTime<Utc>),
    /// ISO-8601 text
    Text(String),
    /// Epoch seconds
    Epoch(i128),
}

impl RawTimestamp {
    /// Classify a JSON value. Floats, booleans, objects and arrays are rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(RawTimestamp::Epoch(i as i128))
                } else if let Some(u) = n.as_u64() {
                    Ok(RawTimestamp::Epoch(u as i128))
                } else {
                    Err(BrokerError::InvalidData(format!(
                        "Timestamp {} must be an integer or ISO-8601 string",
                        n
                    )))
                }
            }
            serde_json::Value::String(s) => Ok(RawTimestamp::Text(s.clone())),
            other => Err(BrokerError::InvalidData(format!(
                "Timestamp {} must be an integer or ISO-8601 string",
                other
            ))),
        }
    }

    /// Resolve to an instant
    pub fn resolve(&self) -> Result<DateTime<Utc>> {
        match self {
            RawTimestamp::Instant(instant) => Ok(*instant),
            RawTimestamp::Epoch(secs) => i64::try_from(*secs)
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or(BrokerError::TimestampOutOfRange(*secs)),
            RawTimestamp::Text(text) => parse_iso8601(text),
        }
    }
}

impl From<DateTime<Utc>> for RawTimestamp {
    fn from(instant: DateTime<Utc>) -> Self {
        RawTimestamp::Instant(instant)
    }
}

/// Decode a JSON timestamp straight to an instant
pub fn parse_json(value: &serde_json::Value) -> Result<DateTime<Utc>> {
    RawTimestamp::from_json(value)?.resolve()
}

fn parse_iso8601(text: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(midnight.and_utc());
    }

    Err(BrokerError::InvalidData(format!(
        "Invalid ISO-8601 timestamp '{}'",
        text
    )))
}

/// Inclusive time window, open-ended on either side
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Build a range, swapping the ends when inverted
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        match (start, end) {
            (Some(s), Some(e)) if s > e => Self {
                start: Some(e),
                end: Some(s),
            },
            _ => Self { start, end },
        }
    }

    /// Decode `[start|null, end|null]`
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let pair = match value.as_array() {
            Some(pair) if pair.len() == 2 => pair,
            _ => {
                return Err(BrokerError::InvalidData(
                    "Time range must be an array of two values".into(),
                ))
            }
        };

        let side = |v: &serde_json::Value| -> Result<Option<DateTime<Utc>>> {
            if v.is_null() {
                Ok(None)
            } else {
                parse_json(v).map(Some)
            }
        };

        Ok(Self::new(side(&pair[0])?, side(&pair[1])?))
    }

    /// Bounds in epoch seconds, as stored
    pub fn as_epoch_secs(&self) -> (Option<i64>, Option<i64>) {
        (
            self.start.map(|s| s.timestamp()),
            self.end.map(|e| e.timestamp()),
        )
    }
}
