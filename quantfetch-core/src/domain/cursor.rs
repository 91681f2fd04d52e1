//! Pagination cursor and series keys.

use super::candle::Candle;
use crate::data::provider::DataError;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Position marking where the next batch should start, in Unix milliseconds (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cursor(i64);

impl Cursor {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Cursor one unit past `candle`, i.e. where the following page begins.
    pub fn after(candle: &Candle) -> Self {
        Self(candle.open_time.saturating_add(1))
    }

    /// Parse a start position.
    ///
    /// Accepted forms, all interpreted as UTC:
    /// - RFC 3339: `2024-08-01T00:00:00Z`, `2024-08-01T02:00:00+02:00`
    /// - naive datetime: `2024-08-01T00:00:00` or `2024-08-01 00:00:00`
    /// - date: `2024-08-01` (midnight)
    /// - raw milliseconds: `1722470400000`
    pub fn parse(input: &str) -> Result<Self, DataError> {
        let s = input.trim();
        let invalid = || DataError::InvalidCursor {
            input: input.to_string(),
        };
        if s.is_empty() {
            return Err(invalid());
        }

        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse::<i64>().map(Self).map_err(|_| invalid());
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self(dt.timestamp_millis()));
        }

        for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(Self(ndt.and_utc().timestamp_millis()));
            }
        }

        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
            return Ok(Self(midnight.and_utc().timestamp_millis()));
        }

        Err(invalid())
    }
}

impl FromStr for Cursor {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Identity of a cached series: (source, instrument, interval).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub source: String,
    pub symbol: String,
    pub interval: String,
}

impl SeriesKey {
    pub fn new(
        source: impl Into<String>,
        symbol: impl Into<String>,
        interval: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }

    /// Filesystem-safe form of the source name.
    pub fn file_source(&self) -> String {
        encode_segment(&self.source)
    }

    /// Filesystem-safe form of the symbol (`BTC/USDT` -> `BTC%2FUSDT`).
    pub fn file_symbol(&self) -> String {
        encode_segment(&self.symbol)
    }

    /// Filesystem-safe form of the interval.
    pub fn file_interval(&self) -> String {
        encode_segment(&self.interval)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.source, self.symbol, self.interval)
    }
}

/// Percent-encode characters that are unsafe in a path segment. Reversible,
/// so distinct keys never share a file.
fn encode_segment(s: &str) -> String {
    // "." and ".." would escape the partition directory.
    if !s.is_empty() && s.chars().all(|c| c == '.') {
        return s.replace('.', "%2E");
    }
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' | '/' | '\\' | ':' | '=' | '*' | '?' | '"' | '<' | '>' | '|' => {
                out.push_str(&format!("%{:02X}", c as u32));
            }
            c if c.is_control() => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{b:02X}"));
                }
            }
            other => out.push(other),
        }
    }
    out
}
