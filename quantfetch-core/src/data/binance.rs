//! Binance spot klines source.
//!
//! Pages through `GET /api/v3/klines`, which returns at most 1000 candles per
//! request starting at `startTime`. Prices arrive as decimal strings inside an
//! array-of-arrays body:
//!
//! `[[openTime, "open", "high", "low", "close", "volume", closeTime, ...], ...]`
//!
//! HTTP 418 (IP ban) and 403 trip the circuit breaker; 429 counts as a failure
//! and surfaces as [`DataError::RateLimited`] so the retry policy can back off.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{retry_after_secs, DataError, SeriesSource};
use crate::domain::{Candle, Cursor};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Binance rejects `limit` above this value.
pub const MAX_LIMIT: u32 = 1000;

/// Weight-based limits allow far more, but 1.2 s keeps long backfills polite.
pub const DEFAULT_RATE_LIMIT: Duration = Duration::from_millis(1200);

/// Binance klines source.
pub struct BinanceSource {
    client: reqwest::blocking::Client,
    base_url: String,
    rate_limit: Duration,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl BinanceSource {
    pub fn new(circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, DataError> {
        Self::with_base_url(DEFAULT_BASE_URL, DEFAULT_RATE_LIMIT, circuit_breaker)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        rate_limit: Duration,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DataError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limit,
            circuit_breaker,
        })
    }

    /// Exchange symbol for a unified pair: `BTC/USDT` -> `BTCUSDT`.
    pub fn market_symbol(symbol: &str) -> String {
        symbol
            .chars()
            .filter(|c| *c != '/' && *c != '-')
            .flat_map(char::to_uppercase)
            .collect()
    }

    /// Build the klines URL for one page.
    pub fn klines_url(&self, symbol: &str, interval: &str, cursor: Cursor, limit: u32) -> String {
        format!(
            "{}/api/v3/klines?symbol={}&interval={interval}&startTime={}&limit={limit}",
            self.base_url,
            Self::market_symbol(symbol),
            cursor.as_millis()
        )
    }

    /// Parse a klines response body into candles.
    pub fn parse_klines(body: &Value) -> Result<Vec<Candle>, DataError> {
        let rows = body
            .as_array()
            .ok_or_else(|| DataError::ResponseFormatChanged("klines body is not an array".into()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let fields = row.as_array().ok_or_else(|| {
                DataError::ResponseFormatChanged(format!("kline {i} is not an array"))
            })?;
            if fields.len() < 6 {
                return Err(DataError::ResponseFormatChanged(format!(
                    "kline {i} has {} fields, expected at least 6",
                    fields.len()
                )));
            }

            let open_time = fields[0].as_i64().ok_or_else(|| {
                DataError::ResponseFormatChanged(format!("kline {i}: open time is not an integer"))
            })?;
            let candle = Candle {
                open_time,
                open: decimal(&fields[1], i, "open")?,
                high: decimal(&fields[2], i, "high")?,
                low: decimal(&fields[3], i, "low")?,
                close: decimal(&fields[4], i, "close")?,
                volume: decimal(&fields[5], i, "volume")?,
            };
            if !candle.is_sane() {
                return Err(DataError::ResponseFormatChanged(format!(
                    "kline {i}: inconsistent OHLC {candle:?}"
                )));
            }
            candles.push(candle);
        }
        Ok(candles)
    }

    /// Map a non-2xx response to an error, updating the circuit breaker.
    fn status_error(
        &self,
        symbol: &str,
        status: StatusCode,
        retry_after: Option<&str>,
        body: String,
    ) -> DataError {
        match status {
            StatusCode::IM_A_TEAPOT | StatusCode::FORBIDDEN => {
                self.circuit_breaker.trip();
                DataError::CircuitBreakerTripped
            }
            StatusCode::TOO_MANY_REQUESTS => {
                self.circuit_breaker.record_failure();
                DataError::RateLimited {
                    retry_after_secs: retry_after_secs(retry_after),
                }
            }
            _ if body.contains("Invalid symbol") => DataError::SymbolNotFound {
                symbol: symbol.to_string(),
            },
            _ => {
                if status.is_server_error() {
                    self.circuit_breaker.record_failure();
                }
                DataError::Http {
                    status: status.as_u16(),
                    body,
                }
            }
        }
    }
}

fn decimal(value: &Value, row: usize, field: &str) -> Result<f64, DataError> {
    let parsed = match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        DataError::ResponseFormatChanged(format!("kline {row}: {field} is not a decimal ({value})"))
    })
}

impl SeriesSource for BinanceSource {
    fn name(&self) -> &str {
        "binance"
    }

    fn fetch_batch(
        &self,
        symbol: &str,
        interval: &str,
        cursor: Cursor,
        limit: u32,
    ) -> Result<Vec<Candle>, DataError> {
        if !self.circuit_breaker.is_allowed() {
            warn!(
                remaining_secs = self.circuit_breaker.remaining_cooldown().as_secs(),
                "circuit breaker open, refusing klines request"
            );
            return Err(DataError::CircuitBreakerTripped);
        }

        let url = self.klines_url(symbol, interval, cursor, limit);
        let resp = self.client.get(&url).send().map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                self.circuit_breaker.record_failure();
            }
            warn!(url = %url, error = %e, "klines request failed");
            DataError::NetworkUnreachable(e.to_string())
        })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let body = resp.text().unwrap_or_default();
            return Err(self.status_error(symbol, status, retry_after.as_deref(), body));
        }

        let body: Value = resp
            .json()
            .map_err(|e| DataError::ResponseFormatChanged(format!("klines body is not JSON: {e}")))?;
        let candles = Self::parse_klines(&body)?;
        self.circuit_breaker.record_success();
        debug!(symbol, interval, %cursor, count = candles.len(), "klines page received");
        Ok(candles)
    }

    fn min_request_interval(&self) -> Duration {
        self.rate_limit
    }

    fn max_batch_limit(&self) -> u32 {
        MAX_LIMIT
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
