//! Yahoo Finance chart client.
//!
//! Fetches OHLCV candles for one ticker and date window from Yahoo's v8 chart
//! API. Prices are auto-adjusted: open/high/low/close are scaled by
//! `adjclose / close` so splits and dividends don't show up as gaps.
//!
//! Yahoo Finance has no official API and is subject to unannounced format changes.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{retry_after_secs, DataError, WindowProvider};
use crate::domain::Candle;
use chrono::NaiveDate;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com";

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
pub(crate) struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

/// Yahoo Finance chart client.
pub struct YahooClient {
    client: reqwest::blocking::Client,
    base_url: String,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl YahooClient {
    pub fn new(circuit_breaker: Arc<CircuitBreaker>) -> Result<Self, DataError> {
        Self::with_base_url(DEFAULT_BASE_URL, circuit_breaker)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| DataError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            circuit_breaker,
        })
    }

    /// Chart URL for `[start, end)`; `end` is exclusive, midnight UTC.
    pub fn chart_url(&self, ticker: &str, interval: &str, start: NaiveDate, end: NaiveDate) -> String {
        let start_ts = start.and_hms_opt(0, 0, 0).map_or(0, |dt| dt.and_utc().timestamp());
        let end_ts = end.and_hms_opt(0, 0, 0).map_or(0, |dt| dt.and_utc().timestamp());
        format!(
            "{}/v8/finance/chart/{ticker}\
             ?period1={start_ts}&period2={end_ts}&interval={interval}\
             &includeAdjustedClose=true&events=div%2Csplits",
            self.base_url
        )
    }

    /// Parse the chart API response into adjusted candles.
    pub(crate) fn parse_response(ticker: &str, resp: ChartResponse) -> Result<Vec<Candle>, DataError> {
        let result = resp.chart.result.ok_or_else(|| match resp.chart.error {
            Some(err) if err.code == "Not Found" => DataError::SymbolNotFound {
                symbol: ticker.to_string(),
            },
            Some(err) => {
                DataError::ResponseFormatChanged(format!("{}: {}", err.code, err.description))
            }
            None => DataError::ResponseFormatChanged("empty result with no error".into()),
        })?;

        let data = result
            .into_iter()
            .next()
            .ok_or_else(|| DataError::ResponseFormatChanged("result array is empty".into()))?;

        // No trading in the window: Yahoo omits the timestamp array entirely.
        let Some(timestamps) = data.timestamp else {
            return Ok(Vec::new());
        };

        let quote = data.indicators.quote.into_iter().next().unwrap_or_default();
        let adj_closes = data
            .indicators
            .adjclose
            .and_then(|v| v.into_iter().next())
            .map(|a| a.adjclose);

        let mut candles = Vec::with_capacity(timestamps.len());
        let mut partial = 0usize;
        for (i, &ts) in timestamps.iter().enumerate() {
            let open = quote.open.get(i).copied().flatten();
            let high = quote.high.get(i).copied().flatten();
            let low = quote.low.get(i).copied().flatten();
            let close = quote.close.get(i).copied().flatten();
            let volume = quote.volume.get(i).copied().flatten();

            // Holidays / halted sessions come back as all-null rows.
            if open.is_none() && high.is_none() && low.is_none() && close.is_none() && volume.is_none() {
                continue;
            }

            let adj_close = adj_closes.as_ref().and_then(|v| v.get(i).copied().flatten());
            let ratio = match (adj_close, close) {
                (Some(adj), Some(c)) if c != 0.0 => adj / c,
                _ => 1.0,
            };

            let candle = Candle {
                open_time: ts.saturating_mul(1000),
                open: open.map_or(f64::NAN, |v| v * ratio),
                high: high.map_or(f64::NAN, |v| v * ratio),
                low: low.map_or(f64::NAN, |v| v * ratio),
                close: close.map_or(f64::NAN, |v| v * ratio),
                volume: volume.unwrap_or(0.0),
            };
            if candle.is_void() {
                partial += 1;
                continue;
            }
            candles.push(candle);
        }

        if partial > 0 {
            warn!(ticker, dropped = partial, "dropped rows with missing prices");
        }
        let insane = candles.iter().filter(|c| !c.is_sane()).count();
        if insane > 0 {
            warn!(ticker, rows = insane, "rows with inconsistent OHLC after adjustment");
        }

        Ok(candles)
    }

    /// Map a non-2xx response to an error, updating the circuit breaker.
    fn status_error(
        &self,
        ticker: &str,
        status: StatusCode,
        retry_after: Option<&str>,
        body: String,
    ) -> DataError {
        match status {
            // IP ban
            StatusCode::FORBIDDEN => {
                self.circuit_breaker.trip();
                DataError::CircuitBreakerTripped
            }
            StatusCode::TOO_MANY_REQUESTS => {
                self.circuit_breaker.record_failure();
                DataError::RateLimited {
                    retry_after_secs: retry_after_secs(retry_after),
                }
            }
            StatusCode::NOT_FOUND => DataError::SymbolNotFound {
                symbol: ticker.to_string(),
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

impl WindowProvider for YahooClient {
    fn name(&self) -> &str {
        "yahoo"
    }

    fn fetch_window(
        &self,
        ticker: &str,
        interval: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Candle>, DataError> {
        if !self.circuit_breaker.is_allowed() {
            warn!(
                remaining_secs = self.circuit_breaker.remaining_cooldown().as_secs(),
                "circuit breaker open, refusing chart request"
            );
            return Err(DataError::CircuitBreakerTripped);
        }

        let url = self.chart_url(ticker, interval, start, end);
        let resp = self.client.get(&url).send().map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                self.circuit_breaker.record_failure();
            }
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
            return Err(self.status_error(ticker, status, retry_after.as_deref(), body));
        }

        let chart: ChartResponse = resp.json().map_err(|e| {
            DataError::ResponseFormatChanged(format!("failed to parse response for {ticker}: {e}"))
        })?;
        let candles = Self::parse_response(ticker, chart)?;
        self.circuit_breaker.record_success();
        debug!(ticker, interval, %start, %end, count = candles.len(), "chart window received");
        Ok(candles)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
