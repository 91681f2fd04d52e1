//! Multi-ticker download orchestrator for window providers.
//!
//! Each ticker is one window request (wrapped in the retry policy), cached
//! under `(provider, ticker, interval)`. Tickers are fetched in parallel on the
//! rayon pool; they share the provider's circuit breaker, so a ban stops the
//! rest of the batch quickly.

use super::cache::SeriesCache;
use super::fetcher::SeriesResult;
use super::provider::{DataError, DataOrigin, Pacer, WindowProvider};
use super::retry::RetryPolicy;
use crate::domain::SeriesKey;
use chrono::{Days, NaiveDate, Utc};
use rayon::prelude::*;
use tracing::{info, instrument, warn};

/// A multi-ticker history request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub tickers: Vec<String>,
    pub interval: String,
    pub start: NaiveDate,
    /// Exclusive end date; `None` means yesterday (UTC).
    pub end: Option<NaiveDate>,
}

impl DownloadRequest {
    pub fn new(tickers: &[&str], interval: impl Into<String>, start: NaiveDate) -> Self {
        Self {
            tickers: tickers.iter().map(|t| t.to_string()).collect(),
            interval: interval.into(),
            start,
            end: None,
        }
    }

    pub fn with_end(mut self, end: NaiveDate) -> Self {
        self.end = Some(end);
        self
    }

    /// Effective end date.
    pub fn end_date(&self) -> NaiveDate {
        self.end.unwrap_or_else(default_end)
    }
}

/// Yesterday in UTC.
pub fn default_end() -> NaiveDate {
    let today = Utc::now().date_naive();
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

/// Outcome of a multi-ticker download, in request order.
#[derive(Debug)]
pub struct DownloadSummary {
    pub series: Vec<SeriesResult>,
    pub errors: Vec<(String, DataError)>,
}

impl DownloadSummary {
    pub fn total(&self) -> usize {
        self.series.len() + self.errors.len()
    }

    pub fn succeeded(&self) -> usize {
        self.series.len()
    }

    pub fn failed(&self) -> usize {
        self.errors.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    /// Series for one ticker, if it succeeded.
    pub fn get(&self, ticker: &str) -> Option<&SeriesResult> {
        self.series.iter().find(|s| s.key.symbol == ticker)
    }
}

/// Downloads and caches many tickers from one window provider.
pub struct Downloader<'a> {
    provider: &'a dyn WindowProvider,
    cache: &'a SeriesCache,
    pacer: &'a dyn Pacer,
    retry: RetryPolicy,
}

impl<'a> Downloader<'a> {
    pub fn new(
        provider: &'a dyn WindowProvider,
        cache: &'a SeriesCache,
        pacer: &'a dyn Pacer,
    ) -> Self {
        Self {
            provider,
            cache,
            pacer,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn key_for(&self, ticker: &str, interval: &str) -> SeriesKey {
        SeriesKey::new(self.provider.name(), ticker, interval)
    }

    /// Download every ticker and overwrite its cache entry.
    #[instrument(skip(self, request), fields(provider = self.provider.name(), tickers = request.tickers.len()))]
    pub fn download(&self, request: &DownloadRequest) -> Result<DownloadSummary, DataError> {
        let tickers = self.validate(request)?;
        Ok(self.run(&tickers, request, false))
    }

    /// Serve cached tickers and download only the missing ones.
    #[instrument(skip(self, request), fields(provider = self.provider.name(), tickers = request.tickers.len()))]
    pub fn load_many(&self, request: &DownloadRequest) -> Result<DownloadSummary, DataError> {
        let tickers = self.validate(request)?;
        Ok(self.run(&tickers, request, true))
    }

    fn run(&self, tickers: &[String], request: &DownloadRequest, use_cache: bool) -> DownloadSummary {
        let end = request.end_date();
        let outcomes: Vec<(String, Result<SeriesResult, DataError>)> = tickers
            .par_iter()
            .map(|ticker| {
                let key = self.key_for(ticker, &request.interval);
                let outcome = if use_cache && self.cache.contains(&key) {
                    match self.cache.load(&key) {
                        Ok(candles) => Ok(SeriesResult {
                            key,
                            candles,
                            origin: DataOrigin::Cache,
                            requests: 0,
                        }),
                        Err(DataError::NoCachedData { .. }) => {
                            self.download_one(ticker, &request.interval, request.start, end)
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    self.download_one(ticker, &request.interval, request.start, end)
                };
                (ticker.clone(), outcome)
            })
            .collect();

        let mut summary = DownloadSummary {
            series: Vec::new(),
            errors: Vec::new(),
        };
        for (ticker, outcome) in outcomes {
            match outcome {
                Ok(series) => summary.series.push(series),
                Err(e) => {
                    warn!(ticker = %ticker, error = %e, "ticker download failed");
                    summary.errors.push((ticker, e));
                }
            }
        }

        info!(
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            total = summary.total(),
            "download complete"
        );
        summary
    }

    fn download_one(
        &self,
        ticker: &str,
        interval: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SeriesResult, DataError> {
        // Shared breaker tripped by an earlier ticker: skip the request.
        if !self.provider.is_available() {
            return Err(DataError::CircuitBreakerTripped);
        }
        let mut candles = self.retry.run(self.pacer, "fetch_window", || {
            self.provider.fetch_window(ticker, interval, start, end)
        })?;
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);

        let key = self.key_for(ticker, interval);
        self.cache.write(&key, &candles)?;
        Ok(SeriesResult {
            key,
            candles,
            origin: DataOrigin::Network,
            requests: 1,
        })
    }

    /// Reject bad windows up front; returns the de-duplicated ticker list.
    fn validate(&self, request: &DownloadRequest) -> Result<Vec<String>, DataError> {
        if request.interval.trim().is_empty() {
            return Err(DataError::InvalidRequest("interval must not be empty".into()));
        }
        let end = request.end_date();
        if request.start >= end {
            return Err(DataError::InvalidRequest(format!(
                "start {} must be before end {end}",
                request.start
            )));
        }

        let mut tickers: Vec<String> = Vec::with_capacity(request.tickers.len());
        for ticker in &request.tickers {
            let ticker = ticker.trim();
            if ticker.is_empty() {
                return Err(DataError::InvalidRequest("ticker must not be empty".into()));
            }
            if !tickers.iter().any(|t| t == ticker) {
                tickers.push(ticker.to_string());
            }
        }
        if tickers.is_empty() {
            return Err(DataError::InvalidRequest("no tickers requested".into()));
        }
        Ok(tickers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::provider::ThreadSleep;
    use crate::domain::Candle;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Serves fixed windows per ticker and counts calls.
    struct FixedProvider {
        windows: HashMap<String, Vec<Candle>>,
        calls: Mutex<Vec<String>>,
        available: AtomicBool,
    }

    impl FixedProvider {
        fn new(tickers: &[&str]) -> Self {
            let windows = tickers
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    let base = i as f64 * 10.0 + 10.0;
                    let candles = (0..3)
                        .map(|d| Candle::new(d * 86_400_000, base, base + 1.0, base - 1.0, base, 100.0))
                        .collect();
                    (t.to_string(), candles)
                })
                .collect();
            Self {
                windows,
                calls: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
            }
        }
    }

    impl WindowProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        fn fetch_window(
            &self,
            ticker: &str,
            _interval: &str,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<Candle>, DataError> {
            self.calls.lock().unwrap().push(ticker.to_string());
            self.windows
                .get(ticker)
                .cloned()
                .ok_or_else(|| DataError::SymbolNotFound {
                    symbol: ticker.to_string(),
                })
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }
    }

    fn request(tickers: &[&str]) -> DownloadRequest {
        DownloadRequest::new(tickers, "1d", NaiveDate::from_ymd_opt(2015, 1, 1).unwrap())
            .with_end(NaiveDate::from_ymd_opt(2025, 3, 9).unwrap())
    }

    #[test]
    fn downloads_and_caches_each_ticker() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let provider = FixedProvider::new(&["AAPL", "MELI", "YPF"]);
        let downloader = Downloader::new(&provider, &cache, &ThreadSleep);

        let summary = downloader.download(&request(&["AAPL", "MELI", "YPF"])).unwrap();

        assert!(summary.all_succeeded());
        assert_eq!(summary.total(), 3);
        let tickers: Vec<&str> = summary.series.iter().map(|s| s.key.symbol.as_str()).collect();
        assert_eq!(tickers, vec!["AAPL", "MELI", "YPF"]);
        for t in ["AAPL", "MELI", "YPF"] {
            assert_eq!(cache.load(&SeriesKey::new("fixed", t, "1d")).unwrap().len(), 3);
        }
    }

    #[test]
    fn unavailable_provider_is_not_requested() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let provider = FixedProvider::new(&["AAPL", "MELI"]);
        let downloader = Downloader::new(&provider, &cache, &ThreadSleep);
        downloader.download(&request(&["AAPL"])).unwrap();
        provider.calls.lock().unwrap().clear();

        provider.available.store(false, Ordering::SeqCst);
        let summary = downloader.load_many(&request(&["AAPL", "MELI"])).unwrap();

        assert!(provider.calls.lock().unwrap().is_empty());
        assert_eq!(summary.get("AAPL").unwrap().origin, DataOrigin::Cache);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].0, "MELI");
        assert!(matches!(summary.errors[0].1, DataError::CircuitBreakerTripped));
    }

    #[test]
    fn failures_do_not_abort_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let provider = FixedProvider::new(&["AAPL"]);
        let downloader = Downloader::new(&provider, &cache, &ThreadSleep);

        let summary = downloader.download(&request(&["AAPL", "DELISTED"])).unwrap();

        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.errors[0].0, "DELISTED");
        assert!(summary.get("AAPL").is_some());
        assert!(summary.get("DELISTED").is_none());
    }

    #[test]
    fn load_many_only_downloads_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let provider = FixedProvider::new(&["AAPL", "MELI"]);
        let downloader = Downloader::new(&provider, &cache, &ThreadSleep);

        downloader.download(&request(&["AAPL"])).unwrap();
        provider.calls.lock().unwrap().clear();

        let summary = downloader.load_many(&request(&["AAPL", "MELI"])).unwrap();
        assert!(summary.all_succeeded());
        assert_eq!(summary.get("AAPL").unwrap().origin, DataOrigin::Cache);
        assert_eq!(summary.get("MELI").unwrap().origin, DataOrigin::Network);
        assert_eq!(*provider.calls.lock().unwrap(), vec!["MELI".to_string()]);
    }

    #[test]
    fn duplicate_tickers_fetched_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let provider = FixedProvider::new(&["AAPL"]);
        let downloader = Downloader::new(&provider, &cache, &ThreadSleep);

        let summary = downloader.download(&request(&["AAPL", " AAPL "])).unwrap();
        assert_eq!(summary.total(), 1);
        assert_eq!(provider.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn rejects_inverted_window_and_empty_tickers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let provider = FixedProvider::new(&["AAPL"]);
        let downloader = Downloader::new(&provider, &cache, &ThreadSleep);

        let inverted = DownloadRequest::new(&["AAPL"], "1d", NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
            .with_end(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert!(matches!(downloader.download(&inverted), Err(DataError::InvalidRequest(_))));
        assert!(matches!(downloader.download(&request(&[])), Err(DataError::InvalidRequest(_))));
        assert!(matches!(downloader.download(&request(&[""])), Err(DataError::InvalidRequest(_))));
        assert!(provider.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn default_end_is_yesterday() {
        let req = DownloadRequest::new(&["AAPL"], "1d", NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        assert_eq!(req.end_date() + Days::new(1), Utc::now().date_naive());
    }
}
