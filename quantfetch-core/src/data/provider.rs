//! Series source trait, pacing seam and structured error types.
//!
//! The SeriesSource trait abstracts over paginated candle APIs (Binance klines,
//! test doubles) so the fetch loop never knows which exchange it is talking to.
//! WindowProvider covers sources that answer a whole date window at once.

use crate::domain::{Candle, Cursor};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Structured error types for data operations.
///
/// These are designed to be displayable in CLI output and log lines.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("invalid start cursor '{input}' (expected RFC 3339, YYYY-MM-DD or epoch milliseconds)")]
    InvalidCursor { input: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("cursor stalled at {cursor}: batch ended at open time {last_open_time}")]
    CursorStalled { cursor: Cursor, last_open_time: i64 },

    #[error("cache error: {0}")]
    CacheError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("parquet I/O error: {0}")]
    ParquetError(String),

    #[error("no cached data for '{key}'")]
    NoCachedData { key: String },

    #[error("config error: {0}")]
    Config(String),
}

impl DataError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DataError::NetworkUnreachable(_) | DataError::RateLimited { .. } => true,
            DataError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Where a returned series came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataOrigin {
    Network,
    Cache,
}

/// Trait for paginated candle sources.
///
/// Implementations handle the transport and response format of one exchange.
/// The fetch loop and cache sit above this trait; sources don't know about either.
pub trait SeriesSource: Send + Sync {
    /// Short identifier used in cache keys (e.g. `binance`).
    fn name(&self) -> &str;

    /// Fetch at most `limit` candles for `symbol` starting at `cursor`, ordered by open time.
    ///
    /// An empty batch means there is nothing at or after `cursor`.
    fn fetch_batch(
        &self,
        symbol: &str,
        interval: &str,
        cursor: Cursor,
        limit: u32,
    ) -> Result<Vec<Candle>, DataError>;

    /// Minimum pause between consecutive requests.
    fn min_request_interval(&self) -> Duration;

    /// Largest `limit` the source accepts per request.
    fn max_batch_limit(&self) -> u32;

    /// Check if the source is currently available (not rate-limited, not blocked).
    fn is_available(&self) -> bool;
}

/// Trait for one-shot window providers (Yahoo chart API, test doubles).
///
/// Unlike [`SeriesSource`] there is no cursor: one call returns every candle
/// in `[start, end)`.
pub trait WindowProvider: Send + Sync {
    /// Short identifier used in cache keys (e.g. `yahoo`).
    fn name(&self) -> &str;

    fn fetch_window(
        &self,
        ticker: &str,
        interval: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Candle>, DataError>;

    fn is_available(&self) -> bool;
}

/// Seconds to wait when a 429 response carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Parse a `Retry-After` header given in whole seconds.
pub(crate) fn retry_after_secs(header: Option<&str>) -> u64 {
    header
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

/// Suspends the caller between requests and between retry attempts.
pub trait Pacer: Send + Sync {
    fn pause(&self, duration: Duration);
}

/// Pacer that blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl Pacer for ThreadSleep {
    fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}
