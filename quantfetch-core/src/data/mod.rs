//! Candle sources, paginated fetching and caching

pub mod binance;
pub mod cache;
pub mod circuit_breaker;
pub mod download;
pub mod fetcher;
pub mod provider;
pub mod retry;
pub mod yahoo;

pub use binance::BinanceSource;
pub use cache::{CacheMeta, SeriesCache};
pub use circuit_breaker::CircuitBreaker;
pub use download::{DownloadRequest, DownloadSummary, Downloader};
pub use fetcher::{FetchRequest, FreshnessPolicy, SeriesFetcher, SeriesResult};
pub use provider::{
    DataError, DataOrigin, Pacer, SeriesSource, ThreadSleep, WindowProvider,
    DEFAULT_RETRY_AFTER_SECS,
};
pub use retry::RetryPolicy;
pub use yahoo::YahooClient;
