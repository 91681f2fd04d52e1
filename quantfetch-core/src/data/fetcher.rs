//! Paginated series fetcher.
//!
//! Repeatedly asks a [`SeriesSource`] for one page of candles at the current
//! cursor, appends the page, moves the cursor one millisecond past the last
//! candle and pauses for the source's minimum request interval. An empty page
//! ends the loop. The accumulated series overwrites the cache entry for
//! `(source, symbol, interval)`.
//!
//! `load` serves the cache entry verbatim when one exists (and is fresh under
//! the configured [`FreshnessPolicy`]) and falls back to `fetch` otherwise.

use super::cache::SeriesCache;
use super::provider::{DataError, DataOrigin, Pacer, SeriesSource};
use super::retry::RetryPolicy;
use crate::domain::{Candle, Cursor, SeriesKey};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Parameters of one paginated download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Instrument identifier as the user writes it (e.g. `BTC/USDT`).
    pub symbol: String,
    /// Candle interval the source recognizes (e.g. `1h`, `1d`).
    pub interval: String,
    /// Start position, parsed with [`Cursor::parse`] when the fetch begins.
    pub start: String,
    /// Maximum candles per request.
    pub limit: u32,
}

impl FetchRequest {
    pub fn new(
        symbol: impl Into<String>,
        interval: impl Into<String>,
        start: impl Into<String>,
        limit: u32,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            start: start.into(),
            limit,
        }
    }
}

/// How long a cache entry may be served by `load`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessPolicy {
    /// `None` serves any existing entry regardless of age.
    pub max_age: Option<Duration>,
}

impl FreshnessPolicy {
    pub fn max_age(max_age: Duration) -> Self {
        Self {
            max_age: Some(max_age),
        }
    }
}

/// Accumulated series plus provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesResult {
    pub key: SeriesKey,
    pub candles: Vec<Candle>,
    pub origin: DataOrigin,
    /// Successful source requests behind this result (zero for cache hits).
    pub requests: usize,
}

impl SeriesResult {
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

/// Drives a [`SeriesSource`] page by page and caches the result.
pub struct SeriesFetcher<'a> {
    source: &'a dyn SeriesSource,
    cache: &'a SeriesCache,
    pacer: &'a dyn Pacer,
    retry: RetryPolicy,
    freshness: FreshnessPolicy,
}

impl<'a> SeriesFetcher<'a> {
    pub fn new(source: &'a dyn SeriesSource, cache: &'a SeriesCache, pacer: &'a dyn Pacer) -> Self {
        Self {
            source,
            cache,
            pacer,
            retry: RetryPolicy::default(),
            freshness: FreshnessPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_freshness(mut self, freshness: FreshnessPolicy) -> Self {
        self.freshness = freshness;
        self
    }

    /// Cache key for a request against this fetcher's source.
    pub fn key_for(&self, request: &FetchRequest) -> SeriesKey {
        SeriesKey::new(self.source.name(), &request.symbol, &request.interval)
    }

    /// Download the full series from `request.start` to the present and cache it.
    ///
    /// All validation happens before the first request. N requests incur
    /// exactly N-1 throttle pauses.
    #[instrument(skip(self), fields(source = self.source.name()))]
    pub fn fetch(&self, request: &FetchRequest) -> Result<SeriesResult, DataError> {
        let mut cursor = self.validate(request)?;
        let key = self.key_for(request);
        let interval = self.source.min_request_interval();

        let mut candles: Vec<Candle> = Vec::new();
        let mut requests = 0usize;

        loop {
            if !self.source.is_available() {
                return Err(DataError::CircuitBreakerTripped);
            }
            let batch = self.retry.run(self.pacer, "fetch_batch", || {
                self.source
                    .fetch_batch(&request.symbol, &request.interval, cursor, request.limit)
            })?;
            requests += 1;

            let Some(last) = batch.last() else {
                debug!(%cursor, requests, "empty batch, series complete");
                break;
            };

            check_batch(&batch, cursor)?;
            let next = Cursor::after(last);

            debug!(%cursor, batch = batch.len(), total = candles.len() + batch.len(), "batch received");
            candles.extend(batch);
            cursor = next;

            self.pacer.pause(interval);
        }

        self.cache.write(&key, &candles)?;
        info!(%key, candles = candles.len(), requests, "series fetched and cached");

        Ok(SeriesResult {
            key,
            candles,
            origin: DataOrigin::Network,
            requests,
        })
    }

    /// Return the cached series for `request`, fetching it if absent or stale.
    #[instrument(skip(self), fields(source = self.source.name()))]
    pub fn load(&self, request: &FetchRequest) -> Result<SeriesResult, DataError> {
        let key = self.key_for(request);

        if self.cache.contains(&key) && self.is_fresh(&key) {
            match self.cache.load(&key) {
                Ok(candles) => {
                    debug!(%key, candles = candles.len(), "served from cache");
                    return Ok(SeriesResult {
                        key,
                        candles,
                        origin: DataOrigin::Cache,
                        requests: 0,
                    });
                }
                Err(DataError::NoCachedData { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.fetch(request)
    }

    fn is_fresh(&self, key: &SeriesKey) -> bool {
        let Some(max_age) = self.freshness.max_age else {
            return true;
        };
        let Some(meta) = self.cache.get_meta(key) else {
            return false;
        };
        let age = Utc::now().signed_duration_since(meta.cached_at);
        match age.to_std() {
            Ok(age) => age <= max_age,
            // cached_at in the future: clock moved backwards, treat as fresh
            Err(_) => true,
        }
    }

    fn validate(&self, request: &FetchRequest) -> Result<Cursor, DataError> {
        if request.symbol.trim().is_empty() {
            return Err(DataError::InvalidRequest("symbol must not be empty".into()));
        }
        if request.interval.trim().is_empty() {
            return Err(DataError::InvalidRequest("interval must not be empty".into()));
        }
        let max = self.source.max_batch_limit();
        if request.limit == 0 || request.limit > max {
            return Err(DataError::InvalidRequest(format!(
                "limit must be between 1 and {max}, got {}",
                request.limit
            )));
        }
        Cursor::parse(&request.start)
    }
}

/// A page must be strictly ascending and lie entirely at or after `cursor`.
fn check_batch(batch: &[Candle], cursor: Cursor) -> Result<(), DataError> {
    if let Some(pair) = batch.windows(2).find(|p| p[1].open_time <= p[0].open_time) {
        return Err(DataError::ValidationError(format!(
            "batch at {cursor} is not strictly ascending: {} then {}",
            pair[0].open_time, pair[1].open_time
        )));
    }
    let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
        return Ok(());
    };
    if last.open_time < cursor.as_millis() {
        return Err(DataError::CursorStalled {
            cursor,
            last_open_time: last.open_time,
        });
    }
    if first.open_time < cursor.as_millis() {
        return Err(DataError::ValidationError(format!(
            "batch at {cursor} starts before the cursor at open time {}",
            first.open_time
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves pre-recorded pages in order, then empty pages.
    struct ScriptedSource {
        pages: Mutex<Vec<Vec<Candle>>>,
        cursors: Mutex<Vec<Cursor>>,
        available: bool,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Vec<Candle>>) -> Self {
            Self {
                pages: Mutex::new(pages.into_iter().rev().collect()),
                cursors: Mutex::new(Vec::new()),
                available: true,
            }
        }
    }

    impl SeriesSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn fetch_batch(
            &self,
            _symbol: &str,
            _interval: &str,
            cursor: Cursor,
            _limit: u32,
        ) -> Result<Vec<Candle>, DataError> {
            self.cursors.lock().unwrap().push(cursor);
            Ok(self.pages.lock().unwrap().pop().unwrap_or_default())
        }

        fn min_request_interval(&self) -> Duration {
            Duration::from_millis(1200)
        }

        fn max_batch_limit(&self) -> u32 {
            1000
        }

        fn is_available(&self) -> bool {
            self.available
        }
    }

    #[derive(Default)]
    struct CountingPacer {
        pauses: Mutex<Vec<Duration>>,
    }

    impl Pacer for CountingPacer {
        fn pause(&self, duration: Duration) {
            self.pauses.lock().unwrap().push(duration);
        }
    }

    fn candle(t: i64) -> Candle {
        Candle::new(t, 1.0, 2.0, 0.5, 1.5, 10.0)
    }

    #[test]
    fn cursor_moves_one_past_last_candle() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let source = ScriptedSource::new(vec![vec![candle(0), candle(10)], vec![candle(20)]]);
        let pacer = CountingPacer::default();

        let result = SeriesFetcher::new(&source, &cache, &pacer)
            .fetch(&FetchRequest::new("BTC/USDT", "1h", "0", 2))
            .unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(result.requests, 3);
        let cursors: Vec<i64> = source.cursors.lock().unwrap().iter().map(|c| c.as_millis()).collect();
        assert_eq!(cursors, vec![0, 11, 21]);
        assert_eq!(pacer.pauses.lock().unwrap().len(), 2);
    }

    #[test]
    fn stalled_cursor_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        // Second page repeats a candle before the cursor.
        let source = ScriptedSource::new(vec![vec![candle(100)], vec![candle(50)]]);
        let pacer = CountingPacer::default();

        let err = SeriesFetcher::new(&source, &cache, &pacer)
            .fetch(&FetchRequest::new("BTC/USDT", "1h", "0", 10))
            .unwrap_err();
        assert!(matches!(err, DataError::CursorStalled { last_open_time: 50, .. }));
        assert!(!cache.contains(&SeriesKey::new("scripted", "BTC/USDT", "1h")));
    }

    #[test]
    fn overlapping_page_fails_on_that_page() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        // Second page repeats candle 10 but still ends past the cursor.
        let source = ScriptedSource::new(vec![
            vec![candle(0), candle(10)],
            vec![candle(10), candle(20)],
            vec![candle(30)],
        ]);
        let pacer = CountingPacer::default();

        let err = SeriesFetcher::new(&source, &cache, &pacer)
            .fetch(&FetchRequest::new("BTC/USDT", "1h", "0", 2))
            .unwrap_err();
        assert!(matches!(err, DataError::ValidationError(_)));
        assert_eq!(source.cursors.lock().unwrap().len(), 2);
        assert!(!cache.contains(&SeriesKey::new("scripted", "BTC/USDT", "1h")));
    }

    #[test]
    fn unordered_page_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let source = ScriptedSource::new(vec![vec![candle(20), candle(10), candle(30)]]);
        let pacer = CountingPacer::default();

        let err = SeriesFetcher::new(&source, &cache, &pacer)
            .fetch(&FetchRequest::new("BTC/USDT", "1h", "0", 10))
            .unwrap_err();
        assert!(matches!(err, DataError::ValidationError(_)));
        assert_eq!(source.cursors.lock().unwrap().len(), 1);
        assert!(pacer.pauses.lock().unwrap().is_empty());
    }

    #[test]
    fn unavailable_source_is_not_requested() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let mut source = ScriptedSource::new(vec![vec![candle(0)]]);
        source.available = false;
        let pacer = CountingPacer::default();

        let err = SeriesFetcher::new(&source, &cache, &pacer)
            .fetch(&FetchRequest::new("BTC/USDT", "1h", "0", 10))
            .unwrap_err();
        assert!(matches!(err, DataError::CircuitBreakerTripped));
        assert!(source.cursors.lock().unwrap().is_empty());
    }

    #[test]
    fn validation_happens_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let source = ScriptedSource::new(vec![vec![candle(0)]]);
        let pacer = CountingPacer::default();
        let fetcher = SeriesFetcher::new(&source, &cache, &pacer);

        for req in [
            FetchRequest::new("", "1h", "0", 10),
            FetchRequest::new("BTC/USDT", "", "0", 10),
            FetchRequest::new("BTC/USDT", "1h", "0", 0),
            FetchRequest::new("BTC/USDT", "1h", "0", 1001),
            FetchRequest::new("BTC/USDT", "1h", "not a date", 10),
        ] {
            assert!(fetcher.fetch(&req).is_err(), "{req:?}");
        }
        assert!(source.cursors.lock().unwrap().is_empty());
    }

    #[test]
    fn key_uses_source_name() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let source = ScriptedSource::new(vec![]);
        let pacer = CountingPacer::default();
        let fetcher = SeriesFetcher::new(&source, &cache, &pacer);
        assert_eq!(
            fetcher.key_for(&FetchRequest::new("ETH/USDT", "4h", "0", 10)),
            SeriesKey::new("scripted", "ETH/USDT", "4h")
        );
    }
}
